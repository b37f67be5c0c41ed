//! Email and text rendering for notifications.

use crate::NotificationPayload;
use realtime_core::{EmailMessage, SmsMessage};

/// Longest text message body, in characters.
const SMS_MAX_CHARS: usize = 160;

/// Renders notification payloads into provider messages.
#[derive(Debug, Clone)]
pub struct NotificationRenderer {
    product_name: String,
    app_url: String,
}

impl Default for NotificationRenderer {
    fn default() -> Self {
        Self::new("Casedesk", "https://app.casedesk.app")
    }
}

impl NotificationRenderer {
    pub fn new(product_name: impl Into<String>, app_url: impl Into<String>) -> Self {
        Self {
            product_name: product_name.into(),
            app_url: app_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Absolute form of a notification link; relative paths hang off the app URL.
    pub fn absolute_link(&self, link: &str) -> String {
        if link.starts_with("http://") || link.starts_with("https://") {
            link.to_string()
        } else {
            format!("{}/{}", self.app_url, link.trim_start_matches('/'))
        }
    }

    pub fn email(&self, to: &str, payload: &NotificationPayload) -> EmailMessage {
        let link = payload.link.as_deref().map(|link| self.absolute_link(link));

        let mut html = format!(
            "<h2>{}</h2>\n<p>{}</p>\n",
            escape_html(&payload.title),
            escape_html(&payload.body).replace('\n', "<br>")
        );
        let mut text = format!("{}\n\n{}\n", payload.title, payload.body);

        if let Some(link) = &link {
            html.push_str(&format!(
                "<p><a href=\"{}\">Open in {}</a></p>\n",
                escape_html(link),
                escape_html(&self.product_name)
            ));
            text.push_str(&format!("\n{}\n", link));
        }

        html.push_str(&format!(
            "<p style=\"color:#888\">{}</p>\n",
            escape_html(&self.product_name)
        ));
        text.push_str(&format!("\n{}\n", self.product_name));

        EmailMessage {
            to: to.to_string(),
            subject: format!("[{}] {}", self.product_name, payload.title),
            html,
            text,
        }
    }

    pub fn sms(&self, to: &str, payload: &NotificationPayload) -> SmsMessage {
        let mut body = format!("[{}] {}", self.product_name, payload.title);
        if let Some(link) = payload.link.as_deref() {
            body.push(' ');
            body.push_str(&self.absolute_link(link));
        }

        SmsMessage {
            to: to.to_string(),
            body: truncate_chars(&body, SMS_MAX_CHARS),
        }
    }
}

fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn truncate_chars(input: &str, max: usize) -> String {
    match input.char_indices().nth(max) {
        Some((end, _)) => input[..end].to_string(),
        None => input.to_string(),
    }
}
