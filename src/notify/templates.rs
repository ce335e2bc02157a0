//! Notification message templates.

use uuid::Uuid;

use super::{DeliveryChannel, DeliveryError, OutboundMessage};
use crate::lifecycle::AlertEventKind;
use crate::model::{Channel, Contact, Id, Monitor, Rule, SensorType};

/// Everything a template needs about one alert event.
pub struct AlertContext<'a> {
    pub kind: AlertEventKind,
    pub monitor: &'a Monitor,
    pub channel: &'a Channel,
    pub rule: &'a Rule,
    pub sensor: &'a SensorType,
    /// Reading value in the sensor's native system.
    pub value: f64,
    pub token: Uuid,
    pub public_url: &'a str,
}

/// Link a contact follows to acknowledge an alert.
pub fn ack_link(public_url: &str, token: Uuid, contact_id: Id) -> String {
    format!(
        "{}/ack?aid={}&bid={}",
        public_url.trim_end_matches('/'),
        urlencoding::encode(&token.to_string()),
        urlencoding::encode(&contact_id.to_string())
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn subject(ctx: &AlertContext<'_>) -> String {
    match ctx.kind {
        AlertEventKind::Resolved => format!("Recovery Notice from {} Monitor", ctx.monitor.name),
        AlertEventKind::Opened | AlertEventKind::Nagged => {
            format!("Alert from {} Monitor", ctx.monitor.name)
        }
    }
}

/// Value formatted in the contact's preferred system, with its unit.
fn display_value(ctx: &AlertContext<'_>, contact: &Contact) -> String {
    let system = contact.preference.measurement_system;
    let value = ctx.sensor.convert(ctx.value, system);
    let unit = ctx.sensor.unit(system);
    if unit.is_empty() {
        format!("{value:.1}")
    } else {
        format!("{value:.1} {unit}")
    }
}

/// Render the message for one contact over one delivery channel.
///
/// Fails with [`DeliveryError::MissingAddress`] when a text message is
/// requested for a contact without an SMS number.
pub fn render(
    ctx: &AlertContext<'_>,
    contact: &Contact,
    channel: DeliveryChannel,
) -> Result<OutboundMessage, DeliveryError> {
    let to = match channel {
        DeliveryChannel::Email => contact.email.clone(),
        DeliveryChannel::Text => contact
            .sms_number
            .clone()
            .filter(|n| !n.trim().is_empty())
            .ok_or(DeliveryError::MissingAddress("sms number"))?,
    };

    let (body, html) = match channel {
        DeliveryChannel::Email => {
            let (body, html) = email_body(ctx, contact);
            (body, Some(html))
        }
        DeliveryChannel::Text => (text_body(ctx, contact), None),
    };

    Ok(OutboundMessage {
        channel,
        contact_id: contact.id,
        to_name: contact.full_name.clone(),
        to,
        sms_gateway: contact.sms_gateway.clone(),
        subject: subject(ctx),
        body,
        html,
    })
}

fn email_body(ctx: &AlertContext<'_>, contact: &Contact) -> (String, String) {
    let monitor = &ctx.monitor.name;
    let channel = &ctx.channel.name;

    if ctx.kind == AlertEventKind::Resolved {
        let body = format!(
            "Monitor: {monitor}, channel: {channel}\nis reporting normal values.\n\nRule: {}\nCurrent reading: {}\n",
            ctx.rule.description(),
            display_value(ctx, contact),
        );
        let html = format!(
            "<p>Monitor: {}, channel: {}<br />is now reporting normal values.</p>\
             <p>Current reading: {}</p>",
            escape_html(monitor),
            escape_html(channel),
            escape_html(&display_value(ctx, contact)),
        );
        return (body, html);
    }

    let link = ack_link(ctx.public_url, ctx.token, contact.id);
    let body = format!(
        "The following rule was activated on monitor: {monitor}, channel: {channel}\n\
         {}\n\n\
         Current reading for {channel} is {}\n\n\
         To acknowledge this alert visit {link}\n",
        ctx.rule.description(),
        display_value(ctx, contact),
    );
    let html = format!(
        "<p>The following rule was activated on monitor: {}, channel: {}<br />\
         <strong>{}</strong></p>\
         <p>Current reading for {} is {}</p>\
         <p>To acknowledge this alert click <a href=\"{}\">here</a></p>",
        escape_html(monitor),
        escape_html(channel),
        escape_html(&ctx.rule.description()),
        escape_html(channel),
        escape_html(&display_value(ctx, contact)),
        escape_html(&link),
    );
    (body, html)
}

fn text_body(ctx: &AlertContext<'_>, contact: &Contact) -> String {
    let monitor = &ctx.monitor.name;
    let channel = &ctx.channel.name;
    let value = display_value(ctx, contact);

    match ctx.kind {
        AlertEventKind::Resolved => {
            format!("Monitor: {monitor}, channel: {channel} is reporting normal values ({value}).")
        }
        AlertEventKind::Opened | AlertEventKind::Nagged => format!(
            "Monitor: {monitor}, {}. Now {value}. Ack: {}",
            ctx.rule.description(),
            ack_link(ctx.public_url, ctx.token, contact.id),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ChannelStatus, ContactMethod, MeasurementSystem, MonitorStatus, Preference, RuleAction,
        RuleState,
    };
    use crate::rules::Condition;
    use crate::units::Conversion;

    struct Parts {
        monitor: Monitor,
        channel: Channel,
        rule: Rule,
        sensor: SensorType,
    }

    fn parts() -> Parts {
        Parts {
            monitor: Monitor {
                id: 1,
                name: "Vaccine fridge".to_string(),
                location: "Clinic".to_string(),
                status: MonitorStatus::Active,
                last_update: None,
            },
            channel: Channel {
                id: 3,
                monitor_id: 1,
                channel_num: 1,
                sensor_type_id: 1,
                name: "Shelf <top>".to_string(),
                status: ChannelStatus::Enabled,
                calibration_offset: 0.0,
                last_reading_id: None,
                last_alert_id: None,
            },
            rule: Rule {
                id: 9,
                name: "too warm".to_string(),
                condition: Condition::GreaterThan { upper: 8.0 },
                action: RuleAction::EmailText,
                state: RuleState::Active,
                paused_until: None,
                contacts: vec![5],
            },
            sensor: SensorType {
                id: 1,
                name: "temperature".to_string(),
                system: MeasurementSystem::Metric,
                metric_unit: "°C".to_string(),
                imperial_unit: "°F".to_string(),
                to_imperial: Conversion::CelsiusToFahrenheit,
                to_metric: Conversion::FahrenheitToCelsius,
            },
        }
    }

    fn contact(system: MeasurementSystem, sms_number: Option<&str>) -> Contact {
        Contact {
            id: 5,
            full_name: "Ada Mensah".to_string(),
            email: "ada@example.com".to_string(),
            sms_number: sms_number.map(str::to_string),
            sms_gateway: Some("txt.example.net".to_string()),
            is_active: true,
            preference: Preference {
                contact_method: ContactMethod::Both,
                measurement_system: system,
            },
        }
    }

    fn ctx(p: &Parts, kind: AlertEventKind) -> AlertContext<'_> {
        AlertContext {
            kind,
            monitor: &p.monitor,
            channel: &p.channel,
            rule: &p.rule,
            sensor: &p.sensor,
            value: 10.0,
            token: Uuid::nil(),
            public_url: "https://vigil.example.org/",
        }
    }

    #[test]
    fn test_ack_link() {
        let link = ack_link("https://vigil.example.org/", Uuid::nil(), 5);
        assert_eq!(
            link,
            "https://vigil.example.org/ack?aid=00000000-0000-0000-0000-000000000000&bid=5"
        );
    }

    #[test]
    fn test_opened_email_has_link_value_and_html() {
        let p = parts();
        let message = render(
            &ctx(&p, AlertEventKind::Opened),
            &contact(MeasurementSystem::Metric, None),
            DeliveryChannel::Email,
        )
        .unwrap();

        assert_eq!(message.subject, "Alert from Vaccine fridge Monitor");
        assert_eq!(message.to, "ada@example.com");
        assert!(message.body.contains("too warm: value > 8"));
        assert!(message.body.contains("10.0 °C"));
        assert!(message.body.contains("/ack?aid=00000000-0000-0000-0000-000000000000&bid=5"));

        let html = message.html.unwrap();
        assert!(html.contains("Shelf &lt;top&gt;"));
        assert!(html.contains("href=\"https://vigil.example.org/ack?aid="));
    }

    #[test]
    fn test_value_converted_to_contact_system() {
        let p = parts();
        let message = render(
            &ctx(&p, AlertEventKind::Nagged),
            &contact(MeasurementSystem::Imperial, Some("5551234")),
            DeliveryChannel::Text,
        )
        .unwrap();

        assert_eq!(message.to, "5551234");
        assert!(message.body.contains("50.0 °F"));
        assert!(message.html.is_none());
    }

    #[test]
    fn test_resolved_messages_have_recovery_subject_and_no_link() {
        let p = parts();
        let c = contact(MeasurementSystem::Metric, Some("5551234"));

        for channel in [DeliveryChannel::Email, DeliveryChannel::Text] {
            let message = render(&ctx(&p, AlertEventKind::Resolved), &c, channel).unwrap();
            assert_eq!(message.subject, "Recovery Notice from Vaccine fridge Monitor");
            assert!(message.body.contains("normal values"));
            assert!(!message.body.contains("/ack?"));
        }
    }

    #[test]
    fn test_text_without_number_is_rejected() {
        let p = parts();
        let err = render(
            &ctx(&p, AlertEventKind::Opened),
            &contact(MeasurementSystem::Metric, None),
            DeliveryChannel::Text,
        )
        .unwrap_err();

        assert!(matches!(err, DeliveryError::MissingAddress(_)));
    }
}
