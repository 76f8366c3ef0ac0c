// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

use std::sync::{Arc, RwLock};

use crate::{auth::TokenVerifier, response, router::Router, sla::SlaPolicy};

/// Context builder is used to build the context of the application.
pub struct ContextBuilder {
    router: Arc<Router>,
    verifier: TokenVerifier,
    sla: SlaPolicy,
    edit_buffer_minutes: i64,
    response: response::Response,
}

impl ContextBuilder {
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            verifier: TokenVerifier::new(Vec::new()),
            sla: SlaPolicy::default(),
            edit_buffer_minutes: 30,
            response: response::Response::default(),
        }
    }

    pub fn verifier(mut self, verifier: TokenVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn sla(mut self, sla: SlaPolicy) -> Self {
        self.sla = sla;
        self
    }

    pub fn edit_buffer_minutes(mut self, minutes: i64) -> Self {
        self.edit_buffer_minutes = minutes;
        self
    }

    pub fn build(self) -> Context {
        Context {
            router: self.router,
            verifier: self.verifier,
            sla: self.sla,
            edit_buffer_minutes: self.edit_buffer_minutes,
            response: self.response,
            abort: Arc::new(RwLock::new(false)),
        }
    }
}

/// The context of the application.
pub struct Context {
    /// Resolves tenant stores.
    pub router: Arc<Router>,
    /// Verifies bearer identities.
    pub verifier: TokenVerifier,
    /// Classifies findings against their remediation deadline.
    pub sla: SlaPolicy,
    /// Scans may not be edited this close to a scheduled run.
    pub edit_buffer_minutes: i64,
    /// Creates responses.
    pub response: response::Response,
    /// Aborts the background loops.
    pub abort: Arc<RwLock<bool>>,
}
