//! Terminal-state classification and outbound message formatting.

use async_trait::async_trait;

use crate::models::TrackingEvent;

/// Substring that marks a delivered-looking status.
const DELIVERED_MARKER: &str = "delivered";

/// Substrings that appear next to delivery wording in non-terminal statuses.
const NEGATIVE_GUARDS: &[&str] = &[
    "out for delivery",
    "failed",
    "unable",
    "attempt",
    "undeliver",
    "not deliver",
    "expected delivery",
];

/// A message ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub recipient: String,
    pub subject: String,
    pub html_body: String,
}

/// Outbound notification transport. Delivery is best-effort: failures are
/// logged by the implementation and never surface to the caller.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: &Notification);
}

/// Returns true if `status` reports a completed delivery.
pub fn is_delivered(status: &str) -> bool {
    let status = status.to_lowercase();

    if !status.contains(DELIVERED_MARKER) {
        return false;
    }

    !NEGATIVE_GUARDS.iter().any(|guard| status.contains(guard))
}

/// `"{Delivered|In Transit} | {courier} | {waybill}"`
pub fn subject_line(waybill: &str, event: &TrackingEvent, delivered: bool) -> String {
    let state = if delivered { "Delivered" } else { "In Transit" };
    format!("{} | {} | {}", state, event.courier_name, waybill)
}

/// Builds the notification for a detected change.
pub fn build_notification(
    recipient: &str,
    waybill: &str,
    event: &TrackingEvent,
    delivered: bool,
) -> Notification {
    Notification {
        recipient: recipient.to_string(),
        subject: subject_line(waybill, event, delivered),
        html_body: render_html(waybill, event, delivered),
    }
}

fn theme_for(courier_name: &str) -> (&'static str, &'static str) {
    match courier_name {
        "Blue Dart" => ("#2563EB", "&#128309;"),
        "Delhivery" => ("#DC2626", "&#128308;"),
        _ => ("#4B5563", "&#128230;"),
    }
}

/// Mobile-first HTML card for one tracking update.
pub fn render_html(waybill: &str, event: &TrackingEvent, delivered: bool) -> String {
    let (theme_color, badge) = theme_for(&event.courier_name);
    let status_color = if delivered { "#166534" } else { theme_color };
    let status_icon = if delivered { "&#9989;" } else { "&#128666;" };

    let courier = escape_html(&event.courier_name);
    let details = escape_html(&event.details);
    let location = escape_html(&event.location);
    let date = escape_html(&event.date);
    let time = escape_html(&event.time);
    let link = escape_html(&event.link);
    let waybill = escape_html(waybill);

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Shipment Update</title>
<style>
body {{ margin: 0; padding: 0; font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, Helvetica, Arial, sans-serif; background-color: #F3F4F6; color: #1F2937; }}
.card {{ max-width: 450px; margin: 0 auto; background-color: #ffffff; border-radius: 16px; overflow: hidden; }}
.header {{ background-color: {theme_color}; padding: 20px; text-align: center; color: #ffffff; font-size: 16px; font-weight: 700; letter-spacing: 1px; text-transform: uppercase; }}
.content {{ padding: 32px 24px; }}
.status-icon {{ font-size: 42px; text-align: center; }}
.status-text {{ font-size: 22px; font-weight: 800; color: {status_color}; text-align: center; margin: 0; }}
.status-sub {{ color: #6B7280; font-size: 14px; text-align: center; margin: 5px 0 30px; }}
.data-table {{ width: 100%; background-color: #F9FAFB; border-radius: 12px; border: 1px solid #E5E7EB; }}
.data-cell {{ padding: 12px 16px; }}
.label {{ font-size: 11px; color: #6B7280; text-transform: uppercase; font-weight: 700; display: block; }}
.value {{ font-size: 15px; color: #111827; display: block; }}
.track-btn {{ display: inline-block; background-color: {theme_color}; color: #ffffff; padding: 16px 36px; font-weight: 700; text-decoration: none; border-radius: 99px; }}
.footer {{ text-align: center; padding-top: 24px; color: #9CA3AF; font-size: 12px; }}
</style>
</head>
<body>
<table width="100%" cellpadding="0" cellspacing="0">
<tr><td align="center" style="padding: 40px 0;">
<div class="card">
<div class="header">{badge} &nbsp; {courier} UPDATE</div>
<div class="content">
<div class="status-icon">{status_icon}</div>
<h1 class="status-text">{details}</h1>
<p class="status-sub">{location}</p>
<table class="data-table">
<tr><td class="data-cell"><span class="label">Date &amp; Time</span><span class="value">{date} &bull; {time}</span></td></tr>
<tr><td class="data-cell"><span class="label">Tracking Number</span><span class="value" style="font-family: monospace;">{waybill}</span></td></tr>
</table>
<div style="text-align: center; margin-top: 32px;"><a href="{link}" class="track-btn">Track Package</a></div>
</div>
</div>
<div class="footer">Automated by waybill-tracker</div>
</td></tr>
</table>
</body>
</html>
"#
    )
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(courier: &str, details: &str) -> TrackingEvent {
        TrackingEvent {
            courier_name: courier.to_string(),
            location: "Hub 1".to_string(),
            details: details.to_string(),
            date: "2024-05-01".to_string(),
            time: "10:00".to_string(),
            link: "https://example.com/track?no=1&x=2".to_string(),
        }
    }

    #[test]
    fn delivered_classification() {
        assert!(is_delivered("Delivered to consignee"));
        assert!(is_delivered("SHIPMENT DELIVERED"));
        assert!(!is_delivered("Out for delivery to consignee"));
        assert!(!is_delivered("Delivery attempt failed"));
        assert!(!is_delivered("Consignee unable to accept delivery"));
        assert!(!is_delivered("Shipment picked up"));
        assert!(!is_delivered("Undelivered - address incomplete"));
        assert!(!is_delivered("Not delivered, consignee not available"));
    }

    #[test]
    fn delivery_wording_without_completion_stays_in_transit() {
        assert!(!is_delivered("Dispatched for delivery"));
        assert!(!is_delivered("Arrived at delivery centre"));
        assert!(!is_delivered("Shipment arrived at delivery centre"));
        assert!(!is_delivered("Delivery rescheduled by consignee"));
        assert!(!is_delivered("Pending delivery"));
    }

    #[test]
    fn subject_format() {
        let ev = event("Blue Dart", "Shipment picked up");
        assert_eq!(
            subject_line("12345678901", &ev, false),
            "In Transit | Blue Dart | 12345678901"
        );
        assert_eq!(
            subject_line("12345678901", &ev, true),
            "Delivered | Blue Dart | 12345678901"
        );
    }

    #[test]
    fn html_escapes_carrier_text() {
        let ev = event("Delhivery", "<script>alert(1)</script>");
        let html = render_html("1234567890123", &ev, false);
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("https://example.com/track?no=1&amp;x=2"));
        assert!(html.contains("#DC2626"));
    }

    #[test]
    fn delivered_card_uses_success_colour() {
        let ev = event("Blue Dart", "Delivered to consignee");
        let notification = build_notification("owner@example.com", "12345678901", &ev, true);
        assert_eq!(notification.recipient, "owner@example.com");
        assert!(notification.subject.starts_with("Delivered"));
        assert!(notification.html_body.contains("#166534"));
    }
}
