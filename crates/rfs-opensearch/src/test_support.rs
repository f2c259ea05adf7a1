use crate::OpenSearchCoordinator;
use chrono::{DateTime, TimeZone, Utc};
use rfs_core::collaborators::{CollaboratorError, HttpRequest, HttpResponse, HttpTransport};
use rfs_core::{Clock, ManualClock};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub fn ts() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 23, 14, 0, 0)
        .single()
        .expect("valid timestamp")
}

/// Replies with queued responses in order and records every request.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<HttpResponse>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn respond(&self, status: u16, body: Value) {
        self.responses
            .lock()
            .expect("responses lock")
            .push_back(HttpResponse {
                status,
                headers: Vec::new(),
                payload: body.to_string().into_bytes(),
            });
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl HttpTransport for ScriptedTransport {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, CollaboratorError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let next = self.responses.lock().expect("responses lock").pop_front();
        Ok(next.unwrap_or_else(|| panic!("no scripted response for {}", request.path)))
    }
}

pub fn coordinator<'a>(
    worker_id: &str,
    transport: &'a ScriptedTransport,
) -> OpenSearchCoordinator<&'a ScriptedTransport> {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(ts()));
    OpenSearchCoordinator::new(transport, worker_id, clock)
}
