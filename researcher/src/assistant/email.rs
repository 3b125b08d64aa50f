use async_trait::async_trait;
use pulldown_cmark::{html, Options, Parser};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use super::error::EmailError;

/// Outbound email delivery. One call is one send attempt; callers do not retry.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), EmailError>;
}

/// Renders a markdown report, footnote citations included, as HTML.
pub fn markdown_to_html(markdown: &str) -> String {
    let options = Options::ENABLE_FOOTNOTES | Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH;
    let mut out = String::with_capacity(markdown.len() * 3 / 2);
    html::push_html(&mut out, Parser::new_ext(markdown, options));
    out
}

/// Postmark delivery from a fixed, pre-verified sender signature.
pub struct PostmarkMailer {
    client: Client,
    server_token: String,
    from: String,
    endpoint: Url,
}

#[derive(Debug, Deserialize)]
struct PostmarkResponse {
    #[serde(rename = "ErrorCode", default)]
    error_code: i64,
    #[serde(rename = "Message", default)]
    message: String,
    #[serde(rename = "MessageID", default)]
    message_id: Option<String>,
}

impl PostmarkMailer {
    pub fn new(client: Client, server_token: String, from: String, base_url: &Url) -> Result<Self, url::ParseError> {
        Ok(Self {
            client,
            server_token,
            from,
            endpoint: base_url.join("email")?,
        })
    }
}

#[async_trait]
impl Mailer for PostmarkMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), EmailError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header("Accept", "application/json")
            .header("X-Postmark-Server-Token", &self.server_token)
            .json(&json!({
                "From": self.from,
                "To": to,
                "Subject": subject,
                "HtmlBody": markdown_to_html(body),
                "TextBody": body,
                "MessageStream": "outbound",
            }))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        // Postmark reports rejections in the body, usually with a 422.
        let parsed: Option<PostmarkResponse> = serde_json::from_str(&text).ok();
        match parsed {
            Some(reply) if status.is_success() && reply.error_code == 0 => {
                tracing::info!(to, message_id = ?reply.message_id, "email sent");
                Ok(())
            }
            Some(reply) => Err(EmailError::Rejected {
                code: reply.error_code,
                message: reply.message,
            }),
            None => Err(EmailError::Rejected {
                code: i64::from(status.as_u16()),
                message: text,
            }),
        }
    }
}
