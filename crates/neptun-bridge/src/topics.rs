//! Bus topic layout
//!
//! ```text
//! <channel>/<MAC>/from                 device frames in (hex on stdio)
//! <destination>/<MAC>/to               command frames out, retained
//! <prefix>/<MAC>/cmd/<name>[/set]      command requests
//! <prefix>/<MAC>/cmd/<field>/result    retry outcomes
//! <prefix>/<MAC>/...                   rendered live state
//! ```
//!
//! Rendering is pure: every function here turns decoded data into a list
//! of [`BusMessage`]s and never touches the registry.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::codec::{FlagsBlock, FrameType, LineIndex, LineKind, SensorReport, SystemTelemetry};
use crate::composer::{CounterUpdate, SettingsChange};
use crate::config::NeptunConfig;
use crate::error::{NeptunError, Result};
use crate::interface::BusMessage;
use crate::registry::DeviceId;
use crate::retry::{Outbound, RetryReport};
use crate::watchdog::LivenessReport;

/// Suffix of inbound device frame topics
pub const FROM_SUFFIX: &str = "from";

/// Suffix of outbound device frame topics
pub const TO_SUFFIX: &str = "to";

/// A classified inbound topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundTopic {
    /// Frame from a device on `channel`
    DeviceFrame {
        /// First topic segment, learned as the device's channel
        channel: String,
        /// Device MAC
        device: DeviceId,
    },
    /// Command request
    Command {
        /// Device MAC
        device: DeviceId,
        /// Command name, e.g. `valve` or `line_2_type`
        name: String,
    },
}

/// A parsed command request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandRequest {
    /// One settings field
    Settings(SettingsChange),
    /// One or more counter lines
    Counters(Vec<CounterUpdate>),
    /// Clock set; `None` means now
    Time(Option<i64>),
}

#[derive(Debug, Deserialize)]
struct CounterPayload {
    value: Option<i64>,
    step: Option<i64>,
}

fn is_truthy(payload: &str, words: &[&str]) -> bool {
    let upper = payload.to_ascii_uppercase();
    words.contains(&upper.as_str())
}

fn numbered(name: &str, prefix: &str, suffix: &str) -> Option<Result<LineIndex>> {
    let middle = name.strip_prefix(prefix)?.strip_suffix(suffix)?;
    Some(
        middle
            .parse::<u8>()
            .map_err(|_| NeptunError::InvalidParameter(format!("bad line in '{}'", name)))
            .and_then(LineIndex::new),
    )
}

/// Parse a command name and payload
///
/// Payloads are trimmed and matched case-insensitively.
pub fn parse_command(name: &str, payload: &[u8]) -> Result<CommandRequest> {
    let text = String::from_utf8_lossy(payload);
    let text = text.trim();

    let change = match name {
        "valve" => SettingsChange::Valve(is_truthy(text, &["1", "ON", "OPEN", "TRUE"])),
        "dry_flag" => {
            SettingsChange::DryFlag(is_truthy(text, &["1", "ON", "OPEN", "TRUE", "YES"]))
        }
        "close_on_offline" => SettingsChange::CloseOnOffline(is_truthy(
            text,
            &["1", "ON", "CLOSE", "TRUE", "YES"],
        )),
        "time" => {
            if text.is_empty() {
                return Ok(CommandRequest::Time(None));
            }
            return text
                .parse::<i64>()
                .map(|epoch| CommandRequest::Time(Some(epoch)))
                .map_err(|_| NeptunError::InvalidParameter(format!("bad epoch '{}'", text)));
        }
        _ => {
            if let Some(line) = numbered(name, "line_", "_type") {
                let kind = if is_truthy(text, &["1", "ON", "TRUE", "YES", "COUNTER"]) {
                    LineKind::Counter
                } else {
                    LineKind::Sensor
                };
                SettingsChange::LineType { line: line?, kind }
            } else if let Some(line) = numbered(name, "counter_", "") {
                return parse_counter(line?, text);
            } else {
                return Err(NeptunError::UnknownCommand(name.to_string()));
            }
        }
    };
    Ok(CommandRequest::Settings(change))
}

fn parse_counter(line: LineIndex, text: &str) -> Result<CommandRequest> {
    if let Ok(value) = text.parse::<i64>() {
        return Ok(CommandRequest::Counters(vec![CounterUpdate::value(line, value)]));
    }

    let payload: CounterPayload = serde_json::from_str(text)
        .map_err(|e| NeptunError::InvalidParameter(format!("counter payload: {}", e)))?;
    if payload.value.is_none() && payload.step.is_none() {
        return Err(NeptunError::InvalidParameter(format!(
            "counter payload for {} sets neither value nor step",
            line
        )));
    }
    Ok(CommandRequest::Counters(vec![CounterUpdate {
        line,
        value: payload.value,
        step: payload.step,
    }]))
}

fn on_off(v: bool) -> &'static str {
    if v {
        "on"
    } else {
        "off"
    }
}

fn yes_no(v: bool) -> &'static str {
    if v {
        "yes"
    } else {
        "no"
    }
}

fn valve_label(open: bool) -> &'static str {
    if open {
        "opened"
    } else {
        "closed"
    }
}

fn close_label(close: bool) -> &'static str {
    if close {
        "close"
    } else {
        "open"
    }
}

fn sensor_json(sensors: &[SensorReport]) -> Value {
    Value::Array(
        sensors
            .iter()
            .map(|s| {
                json!({
                    "line": s.sensor_id,
                    "battery": s.battery_percent,
                    "attention": u8::from(s.leak()),
                    "signal_level": s.signal_level,
                })
            })
            .collect(),
    )
}

fn settings_json(flags: &FlagsBlock) -> Value {
    let lines: serde_json::Map<String, Value> = LineIndex::all()
        .iter()
        .map(|line| {
            (
                line.to_string(),
                Value::from(flags.line_config.kind(*line).as_str()),
            )
        })
        .collect();

    json!({
        "status": {
            "alert": on_off(flags.status.alarm()),
            "dry_flag": yes_no(flags.dry_flag),
            "sensors_lost": yes_no(flags.status.sensor_offline()),
            "battery_discharge_in_module": yes_no(flags.status.main_battery()),
            "battery_discharge_in_sensor": yes_no(flags.status.sensor_battery()),
        },
        "dry_flag": on_off(flags.dry_flag),
        "lines_in": lines,
        "relay_count": flags.relay_count,
        "sensors_count": flags.sensors_count,
        "valve_settings": valve_label(flags.valve_open),
        "close_valve_flag": close_label(flags.close_on_offline),
    })
}

/// Topic naming and rendering for one configuration
#[derive(Debug, Clone)]
pub struct TopicLayout {
    topic_prefix: String,
    cloud_prefix: Option<String>,
    retain: bool,
    publish_raw: bool,
    suppress_wired_on_wireless: bool,
}

impl TopicLayout {
    /// Layout with the given state prefix and defaults elsewhere
    pub fn new(topic_prefix: impl Into<String>) -> Self {
        Self {
            topic_prefix: topic_prefix.into(),
            cloud_prefix: None,
            retain: true,
            publish_raw: false,
            suppress_wired_on_wireless: false,
        }
    }

    /// Create from configuration
    pub fn from_config(config: &NeptunConfig) -> Self {
        Self {
            topic_prefix: config.topics.topic_prefix.clone(),
            cloud_prefix: config.topics.cloud_prefix.clone(),
            retain: config.topics.retain,
            publish_raw: config.topics.publish_raw,
            suppress_wired_on_wireless: config.bridge.suppress_wired_on_wireless,
        }
    }

    /// State and command prefix
    pub fn topic_prefix(&self) -> &str {
        &self.topic_prefix
    }

    /// Whether raw diagnostics are rendered
    pub fn publish_raw(&self) -> bool {
        self.publish_raw
    }

    /// Filters the bridge must subscribe to
    pub fn subscriptions(&self) -> Vec<String> {
        let frames = match &self.cloud_prefix {
            Some(cloud) => format!("{}/+/{}", cloud, FROM_SUFFIX),
            None => format!("+/+/{}", FROM_SUFFIX),
        };
        vec![frames, format!("{}/+/cmd/#", self.topic_prefix)]
    }

    /// Classify an inbound topic; `None` for anything the bridge ignores
    pub fn classify(&self, topic: &str) -> Option<InboundTopic> {
        let parts: Vec<&str> = topic.split('/').collect();
        match parts.as_slice() {
            [channel, device, FROM_SUFFIX] if !channel.is_empty() && !device.is_empty() => {
                if let Some(cloud) = &self.cloud_prefix {
                    if *channel != cloud.as_str() {
                        return None;
                    }
                }
                Some(InboundTopic::DeviceFrame {
                    channel: channel.to_string(),
                    device: DeviceId::new(*device),
                })
            }
            [prefix, device, "cmd", name] | [prefix, device, "cmd", name, "set"]
                if *prefix == self.topic_prefix && !device.is_empty() && !name.is_empty() =>
            {
                Some(InboundTopic::Command {
                    device: DeviceId::new(*device),
                    name: name.to_string(),
                })
            }
            _ => None,
        }
    }

    /// Base topic for a device's rendered state
    pub fn device_base(&self, device: &DeviceId) -> String {
        format!("{}/{}", self.topic_prefix, device)
    }

    /// Topic an outbound frame is published on
    pub fn outbound_topic(&self, destination: &str, device: &DeviceId) -> String {
        format!("{}/{}/{}", destination, device, TO_SUFFIX)
    }

    /// Bus message for an outbound command frame
    pub fn outbound_message(&self, outbound: &Outbound) -> BusMessage {
        BusMessage::new(
            self.outbound_topic(&outbound.destination, &outbound.device),
            outbound.frame.as_bytes().to_vec(),
            true,
        )
    }

    fn msg(&self, base: &str, suffix: &str, payload: impl ToString, retain: bool) -> BusMessage {
        BusMessage::new(format!("{}/{}", base, suffix), payload.to_string(), retain)
    }

    /// Render a decoded `system_state` record
    pub fn render_system(&self, device: &DeviceId, telemetry: &SystemTelemetry) -> Vec<BusMessage> {
        let base = self.device_base(device);
        let mac = telemetry
            .mac
            .clone()
            .unwrap_or_else(|| device.to_string());
        let mut out = self.render_sensors(device, &telemetry.wireless_sensors);

        if let Some(flags) = &telemetry.flags {
            let r = self.retain;
            let status = flags.status;
            out.extend([
                self.msg(&base, "settings/status/alert", on_off(status.alarm()), r),
                self.msg(&base, "settings/status/dry_flag", yes_no(flags.dry_flag), r),
                self.msg(&base, "settings/status/sensors_lost", yes_no(status.sensor_offline()), r),
                self.msg(
                    &base,
                    "settings/status/battery_discharge_in_module",
                    yes_no(status.main_battery()),
                    r,
                ),
                self.msg(
                    &base,
                    "settings/status/battery_discharge_in_sensor",
                    yes_no(status.sensor_battery()),
                    r,
                ),
                self.msg(&base, "settings/dry_flag", on_off(flags.dry_flag), r),
                self.msg(&base, "settings/relay_count", flags.relay_count, r),
                self.msg(&base, "settings/sensors_count", flags.sensors_count, r),
                self.msg(&base, "settings/valve_settings", valve_label(flags.valve_open), r),
                self.msg(
                    &base,
                    "settings/close_valve_flag",
                    close_label(flags.close_on_offline),
                    r,
                ),
            ]);
            for line in LineIndex::all() {
                out.push(self.msg(
                    &base,
                    &format!("settings/lines_in/{}", line),
                    flags.line_config.kind(line).as_str(),
                    r,
                ));
            }
        }

        if let Some(device_id) = &telemetry.device_id {
            out.push(self.msg(&base, "device_id", device_id, self.retain));
        }
        if let Some(signal) = telemetry.module_signal {
            out.push(self.msg(&base, "signal_level", signal, false));
        }
        out.push(self.msg(&base, "mac_address", &mac, self.retain));

        let access = if telemetry.access.unwrap_or(false) {
            "available"
        } else {
            "restricted"
        };
        let mut config = json!({
            "settings": telemetry.flags.as_ref().map(settings_json),
            "device_id": telemetry.device_id.as_deref().unwrap_or(""),
            "mac_address": mac,
            "signal_level": telemetry.module_signal,
            "access_status": access,
        });
        if !telemetry.wireless_sensors.is_empty() {
            config["sensors_status"] = sensor_json(&telemetry.wireless_sensors);
        }
        out.push(self.msg(&base, "config/json", config, self.retain));

        for (line, slot) in LineIndex::all().iter().zip(&telemetry.counters) {
            out.push(self.msg(&base, &format!("counters/{}/value", line), slot.value, false));
            out.push(self.msg(&base, &format!("counters/{}/step", line), slot.step.max(1), false));
        }

        if let Some(wired) = &telemetry.wired_lines {
            for line in LineIndex::all() {
                let shadowed = self.suppress_wired_on_wireless
                    && telemetry
                        .wireless_sensors
                        .iter()
                        .any(|s| s.sensor_id == line.number());
                if shadowed {
                    continue;
                }
                out.push(self.msg(
                    &base,
                    &format!("lines_status/{}", line),
                    on_off(wired.states[line.slot()]),
                    false,
                ));
            }
        }

        let state = serde_json::to_value(telemetry).unwrap_or(Value::Null);
        out.push(self.msg(&base, "state/json", state, false));
        if let Some(flags) = &telemetry.flags {
            out.push(self.msg(&base, "state/valve_open", u8::from(flags.valve_open), false));
            out.push(self.msg(&base, "state/status", flags.status.bits(), false));
            out.push(self.msg(&base, "state/status_name", &flags.status_name, false));
        }
        out
    }

    /// Render wireless sensor reports (from either frame type)
    pub fn render_sensors(&self, device: &DeviceId, sensors: &[SensorReport]) -> Vec<BusMessage> {
        if sensors.is_empty() {
            return Vec::new();
        }
        let base = self.device_base(device);
        let mut out = Vec::with_capacity(sensors.len() * 3 + 1);
        for s in sensors {
            let sensor_base = format!("sensors_status/{}", s.sensor_id);
            out.push(self.msg(&base, &format!("{}/battery", sensor_base), s.battery_percent, false));
            out.push(self.msg(&base, &format!("{}/signal_level", sensor_base), s.signal_level, false));
            out.push(self.msg(&base, &format!("{}/attention", sensor_base), u8::from(s.leak()), false));
        }
        out.push(self.msg(&base, "sensors_status/json", sensor_json(sensors), false));
        out
    }

    /// Raw frame diagnostics; empty unless enabled
    pub fn render_raw(&self, device: &DeviceId, buf: &[u8]) -> Vec<BusMessage> {
        if !self.publish_raw || buf.len() < 4 {
            return Vec::new();
        }
        let base = format!("{}/raw", self.device_base(device));
        let hex = hex::encode(buf);
        let code = buf[3];
        let type_hex = format!("0x{:02x}", code);
        let name = FrameType::from(code).name();
        let by_type = format!("by_type/{}", type_hex);
        let by_name = format!("by_name/{}", name);

        vec![
            self.msg(&base, "hex", &hex, false),
            self.msg(&base, "type", &type_hex, false),
            self.msg(&base, "len", buf.len(), false),
            self.msg(&base, &format!("{}/hex", by_type), &hex, true),
            self.msg(&base, &format!("{}/len", by_type), buf.len(), true),
            self.msg(&base, &format!("{}/name", by_type), name, true),
            self.msg(&base, &format!("{}/hex", by_name), &hex, true),
            self.msg(&base, &format!("{}/type", by_name), &type_hex, true),
        ]
    }

    /// `state/lost` for one watchdog report
    pub fn render_liveness(&self, report: &LivenessReport) -> BusMessage {
        self.msg(
            &self.device_base(&report.device),
            "state/lost",
            u8::from(report.lost),
            false,
        )
    }

    /// `cmd/<field>/result` for one retry outcome
    pub fn render_outcome(&self, report: &RetryReport) -> BusMessage {
        self.msg(
            &self.device_base(&report.device),
            &format!("cmd/{}/result", report.field),
            report.outcome.label(),
            false,
        )
    }

    /// Settings topics republished with the intended value right after a command
    pub fn render_echo(&self, device: &DeviceId, change: &SettingsChange) -> Vec<BusMessage> {
        let base = self.device_base(device);
        let r = self.retain;
        match *change {
            SettingsChange::Valve(open) => {
                vec![self.msg(&base, "settings/valve_settings", valve_label(open), r)]
            }
            SettingsChange::DryFlag(on) => vec![
                self.msg(&base, "settings/dry_flag", on_off(on), r),
                self.msg(&base, "settings/status/dry_flag", yes_no(on), r),
            ],
            SettingsChange::CloseOnOffline(close) => {
                vec![self.msg(&base, "settings/close_valve_flag", close_label(close), r)]
            }
            SettingsChange::LineType { line, kind } => vec![self.msg(
                &base,
                &format!("settings/lines_in/{}", line),
                kind.as_str(),
                r,
            )],
        }
    }
}

impl Default for TopicLayout {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_TOPIC_PREFIX)
    }
}
