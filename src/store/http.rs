use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use futures::channel::mpsc;
use reqwest::{Body, Client, Response, StatusCode, Url};
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::{
    AnalysisRecord, BlobKind, FileRecord, MdRunSummary, Metadata, ProjectHandle, ProjectRef,
    Scope, TrajectoryInfo,
};
use crate::error::IngestError;
use crate::http::{build_client, send_with_retries};
use crate::store::{BlobSink, RemoteStore};

/// REST client for the project database.
///
/// Resources live under `{base}/projects/{id}`; binary payloads are streamed with a
/// chunked `PUT` to `{base}/projects/{id}/blobs/{scope}/{kind}/{name}`.
#[derive(Clone)]
pub struct HttpStore {
    client: Client,
    upload_client: Client,
    base: Url,
    queue_depth: usize,
}

#[derive(Debug, Deserialize)]
struct IndexResponse {
    index: usize,
}

#[derive(Debug, Deserialize)]
struct LocationResponse {
    location: String,
}

#[derive(Debug, Deserialize)]
struct FlagResponse {
    value: bool,
}

impl HttpStore {
    pub fn new(base: &str, timeout: Duration, queue_depth: usize) -> Result<Self, IngestError> {
        let base = Url::parse(base).map_err(|err| IngestError::StoreHttp(err.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(IngestError::StoreHttp(format!("invalid store url: {base}")));
        }
        let client = build_client(Some(timeout), timeout).map_err(IngestError::StoreHttp)?;
        let upload_client = build_client(None, timeout).map_err(IngestError::StoreHttp)?;
        Ok(Self {
            client,
            upload_client,
            base,
            queue_depth: queue_depth.max(1),
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn project_url(&self, project: &str, rest: &[&str]) -> Url {
        let mut segments = vec!["projects", project];
        segments.extend_from_slice(rest);
        self.url(&segments)
    }

    async fn handle_status(response: Response) -> Result<Response, IngestError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "store request failed".to_string());
        Err(IngestError::StoreStatus { status, message })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>, IngestError> {
        let response = send_with_retries(|| self.client.get(url.clone()))
            .await
            .map_err(|err| IngestError::StoreHttp(err.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::handle_status(response).await?;
        let value = response
            .json()
            .await
            .map_err(|err| IngestError::StoreHttp(err.to_string()))?;
        Ok(Some(value))
    }

    async fn require_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, IngestError> {
        let path = url.path().to_string();
        self.get_json(url).await?.ok_or(IngestError::StoreStatus {
            status: 404,
            message: format!("{path} not found"),
        })
    }

    async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: reqwest::Method,
        url: Url,
        body: &B,
    ) -> Result<Response, IngestError> {
        let response = send_with_retries(|| self.client.request(method.clone(), url.clone()).json(body))
            .await
            .map_err(|err| IngestError::StoreHttp(err.to_string()))?;
        Self::handle_status(response).await
    }

    async fn delete(&self, url: Url) -> Result<(), IngestError> {
        let response = send_with_retries(|| self.client.delete(url.clone()))
            .await
            .map_err(|err| IngestError::StoreHttp(err.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::handle_status(response).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for HttpStore {
    async fn create_project(&self) -> Result<ProjectHandle, IngestError> {
        let response = self
            .send_json(reqwest::Method::POST, self.url(&["projects"]), &json!({}))
            .await?;
        response
            .json()
            .await
            .map_err(|err| IngestError::StoreHttp(err.to_string()))
    }

    async fn find_project(
        &self,
        reference: &ProjectRef,
    ) -> Result<Option<ProjectHandle>, IngestError> {
        self.get_json(self.url(&["projects", reference.as_str()]))
            .await
    }

    async fn project_metadata(&self, project: &str) -> Result<Metadata, IngestError> {
        Ok(self
            .get_json(self.project_url(project, &["metadata"]))
            .await?
            .unwrap_or_default())
    }

    async fn update_project_metadata(
        &self,
        project: &str,
        metadata: &Metadata,
    ) -> Result<(), IngestError> {
        self.send_json(
            reqwest::Method::PATCH,
            self.project_url(project, &["metadata"]),
            metadata,
        )
        .await?;
        Ok(())
    }

    async fn md_runs(&self, project: &str) -> Result<Vec<MdRunSummary>, IngestError> {
        self.require_json(self.project_url(project, &["mds"])).await
    }

    async fn add_md_run(&self, project: &str, name: &str) -> Result<usize, IngestError> {
        let response = self
            .send_json(
                reqwest::Method::POST,
                self.project_url(project, &["mds"]),
                &json!({ "name": name }),
            )
            .await?;
        let body: IndexResponse = response
            .json()
            .await
            .map_err(|err| IngestError::StoreHttp(err.to_string()))?;
        Ok(body.index)
    }

    async fn md_metadata(&self, project: &str, md: usize) -> Result<Option<Metadata>, IngestError> {
        let md = md.to_string();
        self.get_json(self.project_url(project, &["mds", &md, "metadata"]))
            .await
    }

    async fn delete_md_metadata(&self, project: &str, md: usize) -> Result<(), IngestError> {
        let md = md.to_string();
        self.delete(self.project_url(project, &["mds", &md, "metadata"]))
            .await
    }

    async fn put_md_metadata(
        &self,
        project: &str,
        md: usize,
        metadata: &Metadata,
    ) -> Result<(), IngestError> {
        let md = md.to_string();
        self.send_json(
            reqwest::Method::PUT,
            self.project_url(project, &["mds", &md, "metadata"]),
            metadata,
        )
        .await?;
        Ok(())
    }

    async fn set_trajectory_info(
        &self,
        project: &str,
        md: usize,
        info: TrajectoryInfo,
    ) -> Result<(), IngestError> {
        let md = md.to_string();
        self.send_json(
            reqwest::Method::PUT,
            self.project_url(project, &["mds", &md, "trajectory"]),
            &info,
        )
        .await?;
        Ok(())
    }

    async fn has_reference(&self, key: &str) -> Result<bool, IngestError> {
        let found: Option<Value> = self.get_json(self.url(&["references", key])).await?;
        Ok(found.is_some())
    }

    async fn load_reference(&self, key: &str, document: &Value) -> Result<(), IngestError> {
        self.send_json(
            reqwest::Method::PUT,
            self.url(&["references", key]),
            document,
        )
        .await?;
        Ok(())
    }

    async fn topology(&self, project: &str) -> Result<Option<Value>, IngestError> {
        self.get_json(self.project_url(project, &["topology"])).await
    }

    async fn put_topology(&self, project: &str, topology: &Value) -> Result<(), IngestError> {
        self.send_json(
            reqwest::Method::PUT,
            self.project_url(project, &["topology"]),
            topology,
        )
        .await?;
        Ok(())
    }

    async fn find_file(
        &self,
        project: &str,
        scope: Scope,
        name: &str,
    ) -> Result<Option<FileRecord>, IngestError> {
        let scope = scope.to_string();
        self.get_json(self.project_url(project, &["files", &scope, name]))
            .await
    }

    async fn delete_file(
        &self,
        project: &str,
        scope: Scope,
        name: &str,
    ) -> Result<(), IngestError> {
        let scope = scope.to_string();
        self.delete(self.project_url(project, &["files", &scope, name]))
            .await
    }

    async fn open_blob(
        &self,
        project: &str,
        scope: Scope,
        name: &str,
        kind: BlobKind,
    ) -> Result<Box<dyn BlobSink>, IngestError> {
        let scope = scope.to_string();
        let kind = kind.to_string();
        let url = self.project_url(project, &["blobs", &scope, &kind, name]);
        let (sender, receiver) = mpsc::channel::<Result<Bytes, std::io::Error>>(self.queue_depth);
        let request = tokio::spawn(
            self.upload_client
                .put(url.clone())
                .body(Body::wrap_stream(receiver))
                .send(),
        );
        debug!(url = %url, "opened blob upload");
        Ok(Box::new(HttpSink {
            sender: Some(sender),
            request: Some(request),
            client: self.client.clone(),
            url,
        }))
    }

    async fn register_file(&self, project: &str, record: &FileRecord) -> Result<(), IngestError> {
        self.send_json(
            reqwest::Method::POST,
            self.project_url(project, &["files"]),
            record,
        )
        .await?;
        Ok(())
    }

    async fn find_analysis(
        &self,
        project: &str,
        scope: Scope,
        name: &str,
    ) -> Result<Option<AnalysisRecord>, IngestError> {
        let scope = scope.to_string();
        self.get_json(self.project_url(project, &["analyses", &scope, name]))
            .await
    }

    async fn delete_analysis(
        &self,
        project: &str,
        scope: Scope,
        name: &str,
    ) -> Result<(), IngestError> {
        let scope = scope.to_string();
        self.delete(self.project_url(project, &["analyses", &scope, name]))
            .await
    }

    async fn put_analysis(
        &self,
        project: &str,
        record: &AnalysisRecord,
    ) -> Result<(), IngestError> {
        let scope = record.scope.to_string();
        self.send_json(
            reqwest::Method::PUT,
            self.project_url(project, &["analyses", &scope, &record.name]),
            record,
        )
        .await?;
        Ok(())
    }

    async fn chains(&self, project: &str) -> Result<Vec<String>, IngestError> {
        Ok(self
            .get_json(self.project_url(project, &["chains"]))
            .await?
            .unwrap_or_default())
    }

    async fn delete_chains(&self, project: &str) -> Result<(), IngestError> {
        self.delete(self.project_url(project, &["chains"])).await
    }

    async fn put_chain(
        &self,
        project: &str,
        chain: &str,
        document: &Value,
    ) -> Result<(), IngestError> {
        self.send_json(
            reqwest::Method::PUT,
            self.project_url(project, &["chains", chain]),
            document,
        )
        .await?;
        Ok(())
    }

    async fn set_published(&self, project: &str, published: bool) -> Result<(), IngestError> {
        self.send_json(
            reqwest::Method::PUT,
            self.project_url(project, &["published"]),
            &json!({ "value": published }),
        )
        .await?;
        Ok(())
    }

    async fn abort_requested(&self, project: &str) -> Result<bool, IngestError> {
        let flag: Option<FlagResponse> = self.get_json(self.project_url(project, &["abort"])).await?;
        Ok(flag.map(|flag| flag.value).unwrap_or(false))
    }

    async fn request_abort(&self, project: &str, abort: bool) -> Result<(), IngestError> {
        self.send_json(
            reqwest::Method::PUT,
            self.project_url(project, &["abort"]),
            &json!({ "value": abort }),
        )
        .await?;
        Ok(())
    }
}

/// Streams chunks into a single chunked `PUT`. The bounded channel feeding the
/// request body is what pauses the uploader while the connection is busy.
struct HttpSink {
    sender: Option<mpsc::Sender<Result<Bytes, std::io::Error>>>,
    request: Option<JoinHandle<Result<Response, reqwest::Error>>>,
    client: Client,
    url: Url,
}

impl HttpSink {
    async fn request_result(&mut self) -> Result<Response, IngestError> {
        let request = self
            .request
            .take()
            .ok_or_else(|| IngestError::StoreHttp("blob already closed".to_string()))?;
        let response = request
            .await
            .map_err(|err| IngestError::StoreHttp(err.to_string()))?
            .map_err(|err| IngestError::StoreHttp(err.to_string()))?;
        HttpStore::handle_status(response).await
    }
}

#[async_trait]
impl BlobSink for HttpSink {
    async fn write(&mut self, chunk: Bytes) -> Result<(), IngestError> {
        let sender = self
            .sender
            .as_mut()
            .ok_or_else(|| IngestError::StoreHttp("blob already closed".to_string()))?;
        if sender.send(Ok(chunk)).await.is_err() {
            // The body stream was dropped, so the request already ended.
            self.sender = None;
            let outcome = self.request_result().await;
            return Err(match outcome {
                Err(err) => err,
                Ok(_) => IngestError::StoreHttp("blob upload closed early".to_string()),
            });
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<String, IngestError> {
        self.sender = None;
        let response = self.request_result().await?;
        let body: LocationResponse = response
            .json()
            .await
            .map_err(|err| IngestError::StoreHttp(err.to_string()))?;
        Ok(body.location)
    }

    async fn abort(&mut self) {
        if let Some(mut sender) = self.sender.take() {
            let _ = sender.try_send(Err(std::io::Error::other("upload aborted")));
        }
        if let Some(request) = self.request.take() {
            request.abort();
        }
        match self.client.delete(self.url.clone()).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(url = %self.url, status = response.status().as_u16(), "partial blob not discarded")
            }
            Err(err) => warn!(url = %self.url, error = %err, "partial blob not discarded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_escape_segments() {
        let store = HttpStore::new("http://db.local/api/", Duration::from_secs(5), 4).unwrap();
        let url = store.project_url("p1", &["files", "md0", "a b.xtc"]);
        assert_eq!(url.as_str(), "http://db.local/api/projects/p1/files/md0/a%20b.xtc");
    }
}
