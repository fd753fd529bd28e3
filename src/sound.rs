//! Sound rule engine: parses the rule document and evaluates it against
//! upstream lines.
//!
//! Evaluation is stateless across lines; a per-rule accumulator exists
//! only for the duration of interpreting that rule's `send` block.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BrokerError;

/// One emitted sound operation, forwarded verbatim to attached
/// transports in a `sound` frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SoundOp {
    /// Play a sound.
    Play {
        #[serde(skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        delay_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pan: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        volume: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sound_id: Option<String>,
    },
    /// Stop a playing sound.
    Stop {
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
}

/// One parsed rule: a compiled trigger plus its `send` block, still in
/// raw JSON call form (interpreted lazily, call by call, at eval time).
#[derive(Debug)]
pub struct SoundRule {
    trigger: Regex,
    gag: bool,
    send: Vec<Value>,
}

/// The full parsed rule document, evaluated in declaration order.
#[derive(Debug, Default)]
pub struct SoundEngine {
    rules: Vec<SoundRule>,
}

/// Raw rule document shape, as read from JSON.
#[derive(Debug, Deserialize)]
struct RawRule {
    trigger: String,
    #[serde(default)]
    gag: bool,
    #[serde(default)]
    send: Vec<Value>,
}

#[derive(Default)]
struct Accumulator {
    channel: Option<String>,
    pan: Option<f64>,
    volume: Option<f64>,
    delay_ms: Option<u64>,
    sound_id: Option<String>,
}

impl SoundEngine {
    /// Parse a rule document from its JSON array form. Rules that fail to
    /// compile (bad regex, missing `trigger`) are skipped with a warning;
    /// the engine continues with the remaining rules, per
    /// `RULE_PARSE_ERROR` semantics.
    #[must_use]
    pub fn parse(document: &str) -> Self {
        let raw_rules: Vec<RawRule> = match serde_json::from_str(document) {
            Ok(rules) => rules,
            Err(e) => {
                log::warn!("sound rule document failed to parse: {e}");
                return Self::default();
            }
        };

        let mut rules = Vec::with_capacity(raw_rules.len());
        for raw in raw_rules {
            match Regex::new(&raw.trigger) {
                Ok(trigger) => rules.push(SoundRule {
                    trigger,
                    gag: raw.gag,
                    send: raw.send,
                }),
                Err(e) => {
                    let err = BrokerError::RuleParseError(format!(
                        "invalid trigger regex {:?}: {e}",
                        raw.trigger
                    ));
                    log::warn!("{err}");
                }
            }
        }
        Self { rules }
    }

    /// Evaluate every rule against `line` in declaration order, returning
    /// the concatenated list of emitted [`SoundOp`]s.
    #[must_use]
    pub fn evaluate(&self, line: &str) -> Vec<SoundOp> {
        let mut events = Vec::new();
        for rule in &self.rules {
            let Some(captures) = rule.trigger.captures(line) else {
                continue;
            };
            let mut acc = Accumulator::default();
            for call in &rule.send {
                apply_call(call, &captures, &mut acc, &mut events);
            }
        }
        events
    }

    /// Whether any rule matching `line` is marked `gag` (suppress the
    /// line from transports; callers decide whether to honor this).
    #[must_use]
    pub fn should_gag(&self, line: &str) -> bool {
        self.rules
            .iter()
            .any(|r| r.gag && r.trigger.is_match(line))
    }

    /// Number of successfully parsed rules.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

fn interpolate(template: &str, captures: &regex::Captures<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '%' {
            if let Some(&next) = chars.peek() {
                if let Some(digit) = next.to_digit(10) {
                    if (1..=9).contains(&digit) {
                        chars.next();
                        if let Some(m) = captures.get(digit as usize) {
                            out.push_str(m.as_str());
                        }
                        continue;
                    }
                }
            }
        }
        out.push(c);
    }
    out
}

fn apply_call(
    call: &Value,
    captures: &regex::Captures<'_>,
    acc: &mut Accumulator,
    events: &mut Vec<SoundOp>,
) {
    let Some(name) = call.get("call").and_then(Value::as_str) else {
        log::warn!("sound rule send block entry missing \"call\" name: {call}");
        return;
    };

    let str_field = |key: &str| -> Option<String> {
        call.get(key)
            .and_then(Value::as_str)
            .map(|s| interpolate(s, captures))
    };
    let num_field = |key: &str| -> Option<f64> { call.get(key).and_then(Value::as_f64) };

    match name {
        "channel" => acc.channel = str_field("channel").or_else(|| str_field("value")),
        "pan" => acc.pan = num_field("pan").or_else(|| num_field("value")),
        "volume" => acc.volume = num_field("volume").or_else(|| num_field("value")),
        "delay" => {
            acc.delay_ms = num_field("delay_ms")
                .or_else(|| num_field("value"))
                .map(|v| v as u64);
        }
        "sound_id" => acc.sound_id = str_field("sound_id").or_else(|| str_field("value")),
        "play" => {
            events.push(SoundOp::Play {
                channel: str_field("channel").or_else(|| acc.channel.clone()),
                path: str_field("path"),
                delay_ms: num_field("delay_ms").map(|v| v as u64).or(acc.delay_ms),
                pan: num_field("pan").or(acc.pan),
                volume: num_field("volume").or(acc.volume),
                sound_id: str_field("sound_id").or_else(|| acc.sound_id.clone()),
            });
        }
        "stop" => {
            events.push(SoundOp::Stop {
                target: str_field("target").or_else(|| acc.channel.clone()),
            });
        }
        other => {
            log::warn!("unrecognized sound rule call {other:?}, ignoring");
        }
    }
}
