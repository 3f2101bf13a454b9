use serde::Serialize;

const SEND_TEXT_PATH: &str = "/api/sendText";
pub const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// Where and as whom a message is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelCredentials {
    pub api_url: String,
    pub api_key: String,
    pub session: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendTextRequest {
    #[serde(rename = "chatId")]
    pub chat_id: String,
    pub text: String,
    pub session: String,
    #[serde(rename = "linkPreview")]
    pub link_preview: bool,
    #[serde(rename = "linkPreviewHighQuality")]
    pub link_preview_high_quality: bool,
    pub reply_to: Option<String>,
}

impl SendTextRequest {
    pub fn new(chat_id: String, text: String, session: String) -> Self {
        Self {
            chat_id,
            text,
            session,
            link_preview: true,
            link_preview_high_quality: false,
            reply_to: None,
        }
    }
}

#[async_trait::async_trait]
pub trait MessageSender: Send + Sync {
    /// Delivers one text message. Any error is a failed attempt; its `Display`
    /// is what ends up in the queue row's diagnostic.
    async fn send_text(
        &self,
        channel: &ChannelCredentials,
        request: &SendTextRequest,
    ) -> anyhow::Result<()>;
}

pub struct WahaClient {
    client: reqwest::Client,
}

impl WahaClient {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl MessageSender for WahaClient {
    async fn send_text(
        &self,
        channel: &ChannelCredentials,
        request: &SendTextRequest,
    ) -> anyhow::Result<()> {
        let url = format!("{}{SEND_TEXT_PATH}", channel.api_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("X-Api-Key", &channel.api_key)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("WAHA API error ({status}): {body}");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn channel(api_url: String) -> ChannelCredentials {
        ChannelCredentials {
            api_url,
            api_key: "waha-test-key".to_string(),
            session: "sales".to_string(),
        }
    }

    #[test]
    fn serializes_wire_field_names() {
        let request = SendTextRequest::new(
            "15551234567@c.us".to_string(),
            "hello".to_string(),
            "sales".to_string(),
        );
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "chatId": "15551234567@c.us",
                "text": "hello",
                "session": "sales",
                "linkPreview": true,
                "linkPreviewHighQuality": false,
                "reply_to": null
            })
        );
    }

    #[tokio::test]
    async fn posts_send_text_with_api_key() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/sendText")
            .match_header("x-api-key", "waha-test-key")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(serde_json::json!({
                "chatId": "15551234567@c.us",
                "text": "your order shipped",
                "session": "sales",
                "linkPreview": true,
                "linkPreviewHighQuality": false,
                "reply_to": null
            })))
            .with_status(201)
            .with_body(r#"{"id":"true_15551234567@c.us_ABC"}"#)
            .create_async()
            .await;

        let client = WahaClient::new().unwrap();
        let request = SendTextRequest::new(
            "15551234567@c.us".to_string(),
            "your order shipped".to_string(),
            "sales".to_string(),
        );
        client
            .send_text(&channel(server.url()), &request)
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn trailing_slash_in_base_url_is_ignored() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/sendText")
            .with_status(200)
            .create_async()
            .await;

        let client = WahaClient::new().unwrap();
        let request = SendTextRequest::new("1@c.us".into(), "x".into(), "sales".into());
        client
            .send_text(&channel(format!("{}/", server.url())), &request)
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_status_carries_response_body() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/sendText")
            .with_status(422)
            .with_body("session sales is not running")
            .create_async()
            .await;

        let client = WahaClient::new().unwrap();
        let request = SendTextRequest::new("1@c.us".into(), "x".into(), "sales".into());
        let err = client
            .send_text(&channel(server.url()), &request)
            .await
            .unwrap_err()
            .to_string();

        assert!(err.contains("422"), "{err}");
        assert!(err.contains("session sales is not running"), "{err}");
    }

    #[tokio::test]
    async fn transport_failure_is_an_error() {
        let client = WahaClient::new().unwrap();
        let request = SendTextRequest::new("1@c.us".into(), "x".into(), "sales".into());
        // port 9 (discard) is closed on test hosts
        let result = client
            .send_text(&channel("http://127.0.0.1:9".to_string()), &request)
            .await;
        assert!(result.is_err());
    }
}
