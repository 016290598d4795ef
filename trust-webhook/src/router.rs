// Copyright (c) 2024 The Trust Webhook Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::Arc;

use anyhow::Result;
use hyper::{header, Body, Method, Request, Response, StatusCode};
use log::{debug, warn};

use crate::pipeline::AdmissionPipeline;

pub const MUTATE_URL: &str = "/mutate";
pub const HEALTH_URL: &str = "/health";
pub const READY_URL: &str = "/ready";

pub struct Router {
    pipeline: Arc<AdmissionPipeline>,
}

impl Router {
    pub fn new(pipeline: Arc<AdmissionPipeline>) -> Self {
        Self { pipeline }
    }

    /// Build json response.
    fn json_response(&self, json: Vec<u8>) -> Result<Response<Body>> {
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json))?)
    }

    fn empty(&self, status: StatusCode) -> Result<Response<Body>> {
        Ok(Response::builder().status(status).body(Body::empty())?)
    }

    /// Build 400 Bad Request response.
    fn bad_request(&self, message: String) -> Result<Response<Body>> {
        Ok(Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(Body::from(message))?)
    }

    /// Build 404 Not Found response.
    fn not_found(&self) -> Result<Response<Body>> {
        Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("URL NOT FOUND"))?)
    }

    /// Build 405 Method Not Allowed response.
    fn not_allowed(&self) -> Result<Response<Body>> {
        Ok(Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .body(Body::from("Method Not Allowed"))?)
    }

    pub async fn route(&self, req: Request<Body>) -> Result<Response<Body>> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();
        debug!("{method} {path}");

        match (path.as_str(), method) {
            (MUTATE_URL, Method::POST) => {
                let body = hyper::body::to_bytes(req.into_body()).await?;
                match self.pipeline.review(&body).await {
                    Ok(review) => self.json_response(serde_json::to_vec(&review)?),
                    Err(e) => {
                        warn!("rejected admission request: {e}");
                        self.bad_request(e.to_string())
                    }
                }
            }
            (HEALTH_URL, Method::GET) => self.empty(StatusCode::OK),
            (READY_URL, Method::GET) => match self.pipeline.ready().await {
                true => self.empty(StatusCode::OK),
                false => self.empty(StatusCode::SERVICE_UNAVAILABLE),
            },
            (MUTATE_URL | HEALTH_URL | READY_URL, _) => self.not_allowed(),
            _ => self.not_found(),
        }
    }
}
