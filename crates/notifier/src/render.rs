//! Email subject and body rendering.

use serde_json::Value;

use courier_common::types::NotificationMessage;

use crate::sender::OutboundEmail;

const DEFAULT_SUBJECT: &str = "Notification";
const MESSAGE_FIELD: &str = "message";

pub fn render_email(message: &NotificationMessage) -> OutboundEmail {
    let subject = message
        .subject
        .clone()
        .unwrap_or_else(|| DEFAULT_SUBJECT.to_string());

    let text = match (&message.template, message.payload.get(MESSAGE_FIELD)) {
        (Some(template), _) => fill_template(template, &message.payload),
        (None, Some(Value::String(body))) => body.clone(),
        _ => field_listing(&message.payload),
    };

    OutboundEmail {
        to: message.recipient.clone(),
        subject,
        text,
        idempotency_key: message.record_id.to_string(),
    }
}

/// Replace `{{field}}` with the payload value. Unknown fields render empty;
/// an unclosed `{{` is kept as-is.
fn fill_template(template: &str, payload: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };
        let field = after[..close].trim();
        if let Some(value) = payload.get(field) {
            out.push_str(&plain(value));
        }
        rest = &after[close + 2..];
    }

    out.push_str(rest);
    out
}

fn field_listing(payload: &Value) -> String {
    match payload {
        Value::Object(fields) => fields
            .iter()
            .map(|(k, v)| format!("{}: {}", k, plain(v)))
            .collect::<Vec<_>>()
            .join("\n"),
        other => plain(other),
    }
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    fn message(payload: Value, subject: Option<&str>, template: Option<&str>) -> NotificationMessage {
        NotificationMessage {
            record_id: Uuid::new_v4(),
            recipient: "ada@example.com".to_string(),
            subject: subject.map(str::to_string),
            template: template.map(str::to_string),
            payload,
        }
    }

    #[test]
    fn test_template_substitution() {
        let msg = message(
            json!({"name": "Ada", "count": 3}),
            Some("Hi"),
            Some("Hello {{name}}, you have {{ count }} items{{missing}}."),
        );
        let email = render_email(&msg);
        assert_eq!(email.subject, "Hi");
        assert_eq!(email.text, "Hello Ada, you have 3 items.");
        assert_eq!(email.idempotency_key, msg.record_id.to_string());
    }

    #[test]
    fn test_unclosed_placeholder_kept() {
        let msg = message(json!({"name": "Ada"}), None, Some("Hi {{name}} {{oops"));
        assert_eq!(render_email(&msg).text, "Hi Ada {{oops");
    }

    #[test]
    fn test_message_field_used_without_template() {
        let msg = message(json!({"message": "Your order shipped"}), None, None);
        let email = render_email(&msg);
        assert_eq!(email.subject, DEFAULT_SUBJECT);
        assert_eq!(email.text, "Your order shipped");
    }

    #[test]
    fn test_field_listing_fallback() {
        let msg = message(json!({"email": "ada@example.com", "name": "Ada"}), None, None);
        assert_eq!(render_email(&msg).text, "email: ada@example.com\nname: Ada");
    }
}
