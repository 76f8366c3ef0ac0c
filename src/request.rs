// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

#[derive(serde::Serialize, Debug)]
pub struct BadRequest {
    line: usize,
    column: usize,
    message: String,
}

/// Reads and deserializes a JSON request body; a malformed body is turned
/// into the matching bad request response.
pub async fn json_request<T>(
    response: &crate::response::Response,
    req: hyper::Request<hyper::Body>,
) -> Result<T, crate::response::Result>
where
    T: serde::de::DeserializeOwned,
{
    let bytes = match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return Err(response.internal_server_error(&e));
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(json) => Ok(json),
        Err(e) => Err(response.bad_request(&BadRequest {
            line: e.line(),
            column: e.column(),
            message: e.to_string(),
        })),
    }
}
