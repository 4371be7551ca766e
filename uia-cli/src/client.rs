use anyhow::{Result, bail};
use bytes::Bytes;
use reqwest::{Client as ReqwestClient, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::types::*;

pub struct Client {
    http: ReqwestClient,
    base: String,
}

impl Client {
    pub fn new(port: u16) -> Result<Self> {
        let http = ReqwestClient::builder().build()?;
        Ok(Self {
            http,
            base: format!("http://127.0.0.1:{port}"),
        })
    }

    async fn send(&self, req: RequestBuilder, path: &str) -> Result<Bytes> {
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        if !status.is_success() {
            if let Ok(err) = serde_json::from_slice::<Envelope<ErrorValue>>(&body) {
                bail!("{path}: {} ({status}): {}", err.value.error, err.value.message);
            }
            bail!("{path}: {status} {}", String::from_utf8_lossy(&body));
        }
        Ok(body)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let body = self
            .send(self.http.get(format!("{}{path}", self.base)), path)
            .await?;
        Ok(serde_json::from_slice::<Envelope<T>>(&body)?.value)
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, json: &impl serde::Serialize) -> Result<T> {
        let body = self
            .send(self.http.post(format!("{}{path}", self.base)).json(json), path)
            .await?;
        Ok(serde_json::from_slice::<Envelope<T>>(&body)?.value)
    }

    pub async fn status(&self) -> Result<Status> {
        self.get("/status").await
    }

    pub async fn create_session(&self, capabilities: Map<String, Value>) -> Result<String> {
        let session: NewSession = self
            .post(
                "/session",
                &NewSessionRequest {
                    capabilities: SessionCapabilities {
                        always_match: capabilities,
                    },
                },
            )
            .await?;
        Ok(session.session_id)
    }

    pub async fn delete_session(&self, session: &str) -> Result<()> {
        let path = format!("/session/{session}");
        self.send(self.http.delete(format!("{}{path}", self.base)), &path)
            .await?;
        Ok(())
    }

    pub async fn find(
        &self,
        session: &str,
        context: Option<&str>,
        using: &str,
        value: &str,
        all: bool,
    ) -> Result<Vec<String>> {
        let mut path = format!("/session/{session}");
        if let Some(context) = context {
            path.push_str(&format!("/element/{context}"));
        }
        path.push_str(if all { "/elements" } else { "/element" });
        let req = FindRequest {
            using: using.to_string(),
            value: value.to_string(),
        };
        if all {
            let refs: Vec<ElementRef> = self.post(&path, &req).await?;
            Ok(refs.into_iter().map(|r| r.id).collect())
        } else {
            let r: ElementRef = self.post(&path, &req).await?;
            Ok(vec![r.id])
        }
    }

    pub async fn attribute(&self, session: &str, element: &str, name: &str) -> Result<Option<String>> {
        self.get(&format!("/session/{session}/element/{element}/attribute/{name}"))
            .await
    }

    pub async fn click(&self, session: &str, element: &str) -> Result<()> {
        let _: Value = self
            .post(
                &format!("/session/{session}/element/{element}/click"),
                &Map::new(),
            )
            .await?;
        Ok(())
    }

    pub async fn type_text(&self, session: &str, element: &str, text: &str) -> Result<()> {
        let _: Value = self
            .post(
                &format!("/session/{session}/element/{element}/value"),
                &ValueRequest {
                    text: text.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn source(&self, session: &str) -> Result<String> {
        self.get(&format!("/session/{session}/source")).await
    }

    pub async fn settings(&self, session: &str) -> Result<Value> {
        self.get(&format!("/session/{session}/appium/settings")).await
    }

    pub async fn update_settings(&self, session: &str, settings: Map<String, Value>) -> Result<Value> {
        self.post(
            &format!("/session/{session}/appium/settings"),
            &SettingsRequest { settings },
        )
        .await
    }
}
