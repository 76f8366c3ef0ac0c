// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

mod context;
mod entry;

pub use context::{Context, ContextBuilder};
pub use entry::entrypoint;

/// Builds the hyper service wiring for the entrypoint.
#[macro_export]
macro_rules! make_svc {
    ($ctx:expr) => {{
        use hyper::service::{make_service_fn, service_fn};
        let context = std::sync::Arc::clone($ctx);
        make_service_fn(move |_conn| {
            let context = std::sync::Arc::clone(&context);
            async move {
                Ok::<_, hyper::http::Error>(service_fn(move |req| {
                    $crate::controller::entrypoint(req, std::sync::Arc::clone(&context))
                }))
            }
        })
    }};
}
