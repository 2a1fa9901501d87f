//! HTTP convenience manager - verb methods over a session and a base URL

use crate::engine::TaskOutcome;
use crate::error::SessionError;
use crate::request::RequestSerializer;
use crate::session::{SessionManager, TaskHandle, TaskOptions};
use netsession_types::HttpMethod;
use parking_lot::RwLock;
use serde_json::Value;
use std::ops::Deref;
use std::sync::Arc;
use url::Url;

/// Builds requests relative to a base URL and starts them immediately
#[derive(Clone)]
pub struct HttpSessionManager {
    session: SessionManager,
    base_url: Option<Url>,
    request_serializer: Arc<RwLock<RequestSerializer>>,
}

impl HttpSessionManager {
    pub fn new(session: SessionManager, base_url: Option<Url>) -> Self {
        Self {
            session,
            base_url: base_url.map(with_trailing_slash),
            request_serializer: Default::default(),
        }
    }

    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn set_request_serializer(&self, serializer: RequestSerializer) {
        *self.request_serializer.write() = serializer;
    }

    /// Resolve `path` against the base URL, or parse it as absolute without one
    pub fn url_for(&self, path: &str) -> Result<Url, SessionError> {
        let resolved = match &self.base_url {
            Some(base) => base.join(path),
            None => Url::parse(path),
        };
        resolved.map_err(|e| SessionError::InvalidRequest(format!("{}: {}", path, e)))
    }

    pub fn get(
        &self,
        path: &str,
        parameters: Option<&Value>,
        completion: impl FnOnce(TaskOutcome) + Send + 'static,
    ) -> Result<TaskHandle, SessionError> {
        self.start(HttpMethod::Get, path, parameters, completion)
    }

    pub fn head(
        &self,
        path: &str,
        parameters: Option<&Value>,
        completion: impl FnOnce(TaskOutcome) + Send + 'static,
    ) -> Result<TaskHandle, SessionError> {
        self.start(HttpMethod::Head, path, parameters, completion)
    }

    pub fn post(
        &self,
        path: &str,
        parameters: Option<&Value>,
        completion: impl FnOnce(TaskOutcome) + Send + 'static,
    ) -> Result<TaskHandle, SessionError> {
        self.start(HttpMethod::Post, path, parameters, completion)
    }

    pub fn put(
        &self,
        path: &str,
        parameters: Option<&Value>,
        completion: impl FnOnce(TaskOutcome) + Send + 'static,
    ) -> Result<TaskHandle, SessionError> {
        self.start(HttpMethod::Put, path, parameters, completion)
    }

    pub fn patch(
        &self,
        path: &str,
        parameters: Option<&Value>,
        completion: impl FnOnce(TaskOutcome) + Send + 'static,
    ) -> Result<TaskHandle, SessionError> {
        self.start(HttpMethod::Patch, path, parameters, completion)
    }

    pub fn delete(
        &self,
        path: &str,
        parameters: Option<&Value>,
        completion: impl FnOnce(TaskOutcome) + Send + 'static,
    ) -> Result<TaskHandle, SessionError> {
        self.start(HttpMethod::Delete, path, parameters, completion)
    }

    fn start(
        &self,
        method: HttpMethod,
        path: &str,
        parameters: Option<&Value>,
        completion: impl FnOnce(TaskOutcome) + Send + 'static,
    ) -> Result<TaskHandle, SessionError> {
        let url = self.url_for(path)?;
        let request = self.request_serializer.read().request(method, url, parameters)?;
        let handle = self
            .session
            .data_task_with(request, TaskOptions::default(), completion)?;
        handle.resume();
        Ok(handle)
    }
}

impl Deref for HttpSessionManager {
    type Target = SessionManager;

    fn deref(&self) -> &SessionManager {
        &self.session
    }
}

/// Relative paths resolve beneath the base only if it ends with `/`
fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SessionTask;
    use crate::testing::MockBackend;
    use netsession_types::{SessionConfig, TaskKind, TaskState};
    use serde_json::json;

    fn manager(base: &str) -> (HttpSessionManager, Arc<MockBackend>) {
        let backend = MockBackend::new();
        let session = SessionManager::new(backend.clone(), &SessionConfig::default()).unwrap();
        (
            HttpSessionManager::new(session, Some(Url::parse(base).unwrap())),
            backend,
        )
    }

    #[tokio::test]
    async fn test_base_url_gets_trailing_slash() {
        let (http, _) = manager("https://api.example.com/v1");
        assert_eq!(http.base_url().unwrap().as_str(), "https://api.example.com/v1/");
        assert_eq!(
            http.url_for("users/7").unwrap().as_str(),
            "https://api.example.com/v1/users/7"
        );
        assert_eq!(
            http.url_for("/root").unwrap().as_str(),
            "https://api.example.com/root"
        );
    }

    #[tokio::test]
    async fn test_verbs_create_and_resume_data_tasks() {
        let (http, backend) = manager("https://api.example.com/v1/");
        let handle = http
            .get("search", Some(&json!({"q": "pins"})), |_| {})
            .unwrap();

        assert_eq!(handle.kind(), TaskKind::Data);
        assert_eq!(handle.state(), TaskState::Running);
        let request = backend.task(handle.id()).original_request();
        assert_eq!(request.url.as_str(), "https://api.example.com/v1/search?q=pins");

        let posted = http.post("items", Some(&json!({"a": 1})), |_| {}).unwrap();
        let request = backend.task(posted.id()).original_request();
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.body.as_deref(), Some(&b"a=1"[..]));
    }
}
