//! Slot description grammar.
//!
//! The client describes each slot with a short free-text string:
//!
//! - `cpu`, `cpu:N`, `smp:N` for CPU slots (N = thread count)
//! - `gpu:B:S PREFIX [NAME]` for GPU slots on PCI bus B, slot S
//! - `gpu:I:PREFIX [NAME]` for legacy GPU descriptions without bus/slot
//!
//! Anything absent, empty, or whitespace-only parses to "no description".

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Parsed slot description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SlotDescription {
    Cpu {
        /// Thread count; `None` when the description carries no count.
        threads: Option<u32>,
    },
    Gpu {
        bus: Option<u32>,
        slot: Option<u32>,
        /// Vendor chip prefix, e.g. `TU116`.
        prefix: Option<String>,
        /// Human-readable processor name, e.g. `GeForce GTX 1660 Ti`.
        processor: Option<String>,
    },
}

static GPU_BUS_SLOT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^gpu:(\d+):(\d+)(?:\s+(.*))?$").expect("valid regex")
});
static GPU_LEGACY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^gpu:(\d+):(.*)$").expect("valid regex"));

impl SlotDescription {
    /// Parse a description string. Returns `None` for missing or blank input
    /// and for text that is neither a CPU nor a GPU form.
    pub fn parse<'a>(text: impl Into<Option<&'a str>>) -> Option<Self> {
        let text = text.into()?.trim();
        if text.is_empty() {
            return None;
        }

        let lower = text.to_ascii_lowercase();
        if lower.starts_with("cpu") || lower.starts_with("smp") {
            return Some(Self::Cpu {
                threads: parse_cpu_threads(text),
            });
        }
        if lower.starts_with("gpu") {
            return Some(parse_gpu(text));
        }
        None
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, Self::Gpu { .. })
    }

    pub fn threads(&self) -> Option<u32> {
        match self {
            Self::Cpu { threads } => *threads,
            Self::Gpu { .. } => None,
        }
    }

    pub fn processor(&self) -> Option<&str> {
        match self {
            Self::Gpu { processor, .. } => processor.as_deref(),
            Self::Cpu { .. } => None,
        }
    }
}

fn parse_cpu_threads(text: &str) -> Option<u32> {
    let (_, rest) = text.split_once(':')?;
    rest.split_whitespace().next()?.parse().ok()
}

fn parse_gpu(text: &str) -> SlotDescription {
    if let Some(caps) = GPU_BUS_SLOT_RE.captures(text) {
        let (prefix, processor) = split_processor_name(caps.get(3).map_or("", |m| m.as_str()));
        return SlotDescription::Gpu {
            bus: caps[1].parse().ok(),
            slot: caps[2].parse().ok(),
            prefix,
            processor,
        };
    }
    if let Some(caps) = GPU_LEGACY_RE.captures(text) {
        let (prefix, processor) = split_processor_name(&caps[2]);
        return SlotDescription::Gpu {
            bus: None,
            slot: None,
            prefix,
            processor,
        };
    }
    SlotDescription::Gpu {
        bus: None,
        slot: None,
        prefix: None,
        processor: None,
    }
}

/// Split `PREFIX [NAME]` into its parts. Text without brackets is taken as the
/// processor name.
pub fn split_processor_name(text: &str) -> (Option<String>, Option<String>) {
    let text = text.trim();
    if text.is_empty() {
        return (None, None);
    }
    match (text.find('['), text.rfind(']')) {
        (Some(open), Some(close)) if open < close => {
            let prefix = text[..open].trim();
            let name = text[open + 1..close].trim();
            (non_empty(prefix), non_empty(name))
        }
        _ => (None, Some(text.to_string())),
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_with_threads() {
        assert_eq!(
            SlotDescription::parse("cpu:16"),
            Some(SlotDescription::Cpu { threads: Some(16) })
        );
        assert_eq!(
            SlotDescription::parse("smp:4"),
            Some(SlotDescription::Cpu { threads: Some(4) })
        );
    }

    #[test]
    fn test_cpu_without_threads() {
        assert_eq!(
            SlotDescription::parse("cpu"),
            Some(SlotDescription::Cpu { threads: None })
        );
    }

    #[test]
    fn test_gpu_with_bus_and_slot() {
        let parsed = SlotDescription::parse("gpu:8:0 TU116 [GeForce GTX 1660 Ti]");
        assert_eq!(
            parsed,
            Some(SlotDescription::Gpu {
                bus: Some(8),
                slot: Some(0),
                prefix: Some("TU116".to_string()),
                processor: Some("GeForce GTX 1660 Ti".to_string()),
            })
        );
        let parsed = parsed.unwrap();
        assert!(parsed.is_gpu());
        assert_eq!(parsed.processor(), Some("GeForce GTX 1660 Ti"));
        assert_eq!(parsed.threads(), None);
    }

    #[test]
    fn test_gpu_legacy_form() {
        assert_eq!(
            SlotDescription::parse("gpu:0:GK110 [GeForce GTX 780]"),
            Some(SlotDescription::Gpu {
                bus: None,
                slot: None,
                prefix: Some("GK110".to_string()),
                processor: Some("GeForce GTX 780".to_string()),
            })
        );
    }

    #[test]
    fn test_gpu_without_brackets_uses_text_as_processor() {
        assert_eq!(
            SlotDescription::parse("gpu:1:2 Radeon VII"),
            Some(SlotDescription::Gpu {
                bus: Some(1),
                slot: Some(2),
                prefix: None,
                processor: Some("Radeon VII".to_string()),
            })
        );
    }

    #[test]
    fn test_blank_input_is_no_description() {
        assert_eq!(SlotDescription::parse(None::<&str>), None);
        assert_eq!(SlotDescription::parse(""), None);
        assert_eq!(SlotDescription::parse("  "), None);
    }

    #[test]
    fn test_unknown_form_is_no_description() {
        assert_eq!(SlotDescription::parse("fpga:1"), None);
    }
}
