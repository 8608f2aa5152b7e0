//! Throughput and credit estimates.
//!
//! A frame time (usually a benchmark average or the current unit's average) is
//! combined with protein metadata to estimate units per day (UPD), credit with
//! the quick-return bonus applied, and points per day (PPD).
//!
//! ## Bonus
//!
//! Units returned before their deadline earn a multiplier on base credit:
//!
//! ```text
//! multiplier = max(1, sqrt(preferred_days * k / unit_days))
//! ```
//!
//! Past the maximum (deadline) days, with no k factor, or with an unknown unit
//! time the multiplier is 1.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const SECONDS_PER_DAY: f64 = 86_400.0;

fn default_frames() -> u32 {
    100
}

/// Project metadata as published in the project summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Protein {
    #[serde(rename = "id")]
    pub project_id: u32,
    /// Base credit.
    pub credit: f64,
    #[serde(default = "default_frames")]
    pub frames: u32,
    #[serde(rename = "k", default)]
    pub k_factor: f64,
    /// Preferred days.
    #[serde(rename = "timeout", default)]
    pub preferred_days: f64,
    /// Maximum days.
    #[serde(rename = "deadline", default)]
    pub maximum_days: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atoms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core: Option<String>,
}

impl Protein {
    pub fn new(project_id: u32, credit: f64, frames: u32) -> Self {
        Self {
            project_id,
            credit,
            frames,
            k_factor: 0.0,
            preferred_days: 0.0,
            maximum_days: 0.0,
            atoms: None,
            core: None,
        }
    }

    pub fn with_bonus(mut self, k_factor: f64, preferred_days: f64, maximum_days: f64) -> Self {
        self.k_factor = k_factor;
        self.preferred_days = preferred_days;
        self.maximum_days = maximum_days;
        self
    }

    pub fn is_unknown(&self) -> bool {
        self.project_id == 0
    }
}

/// Proteins keyed by project id.
#[derive(Debug, Clone, Default)]
pub struct ProteinCatalog {
    proteins: HashMap<u32, Protein>,
}

impl ProteinCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a project-summary JSON array. Later duplicates replace earlier ones.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let proteins: Vec<Protein> = serde_json::from_str(json)?;
        let mut catalog = Self::new();
        for protein in proteins {
            catalog.insert(protein);
        }
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading project summary {}", path.display()))?;
        let catalog = Self::from_json(&json)
            .with_context(|| format!("parsing project summary {}", path.display()))?;
        info!(proteins = catalog.len(), path = %path.display(), "loaded project summary");
        Ok(catalog)
    }

    pub fn insert(&mut self, protein: Protein) {
        self.proteins.insert(protein.project_id, protein);
    }

    pub fn get(&self, project_id: u32) -> Option<&Protein> {
        self.proteins.get(&project_id)
    }

    pub fn len(&self) -> usize {
        self.proteins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proteins.is_empty()
    }
}

/// How unit time is derived for the bonus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BonusCalculation {
    /// No bonus.
    None,
    /// Unit time is frame time times the protein's frame count.
    FrameTime,
    /// Unit time is wall-clock time since assignment.
    #[default]
    DownloadTime,
}

/// Wall-clock facts about a unit used by [`BonusCalculation::DownloadTime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitTimes {
    pub assigned: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub frames_complete: u32,
    pub now: DateTime<Utc>,
}

impl UnitTimes {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            assigned: None,
            finished: None,
            frames_complete: 0,
            now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProductionValues {
    pub frame_time: Duration,
    pub unit_time: Duration,
    pub bonus_multiplier: f64,
    pub credit: f64,
    pub upd: f64,
    pub ppd: f64,
}

impl ProductionValues {
    fn zero(frame_time: Duration) -> Self {
        Self {
            frame_time,
            unit_time: Duration::ZERO,
            bonus_multiplier: 1.0,
            credit: 0.0,
            upd: 0.0,
            ppd: 0.0,
        }
    }
}

pub fn bonus_multiplier(
    k_factor: f64,
    preferred_days: f64,
    maximum_days: f64,
    unit_time: Duration,
) -> f64 {
    if k_factor <= 0.0 || unit_time.is_zero() {
        return 1.0;
    }
    let unit_days = unit_time.as_secs_f64() / SECONDS_PER_DAY;
    if unit_days > maximum_days {
        return 1.0;
    }
    (preferred_days * k_factor / unit_days).sqrt().max(1.0)
}

/// Unit time under `bonus`; zero when it cannot be determined.
pub fn unit_time(
    frame_time: Duration,
    protein: &Protein,
    bonus: BonusCalculation,
    times: &UnitTimes,
) -> Duration {
    match bonus {
        BonusCalculation::None | BonusCalculation::FrameTime => frame_time * protein.frames,
        BonusCalculation::DownloadTime => {
            let Some(assigned) = times.assigned else {
                return Duration::ZERO;
            };
            match times.finished {
                Some(finished) => (finished - assigned).to_std().unwrap_or_default(),
                None => {
                    let elapsed = (times.now - assigned).to_std().unwrap_or_default();
                    let remaining = protein.frames.saturating_sub(times.frames_complete);
                    elapsed + frame_time * remaining
                }
            }
        }
    }
}

pub fn get_production(
    frame_time: Duration,
    protein: &Protein,
    bonus: BonusCalculation,
    times: &UnitTimes,
) -> ProductionValues {
    if frame_time.is_zero() || protein.frames == 0 {
        return ProductionValues::zero(frame_time);
    }

    let unit_time = unit_time(frame_time, protein, bonus, times);
    let multiplier = match bonus {
        BonusCalculation::None => 1.0,
        _ => bonus_multiplier(
            protein.k_factor,
            protein.preferred_days,
            protein.maximum_days,
            unit_time,
        ),
    };
    let credit = protein.credit * multiplier;
    let upd = SECONDS_PER_DAY / (frame_time.as_secs_f64() * f64::from(protein.frames));

    debug!(
        project = protein.project_id,
        frame_time_secs = frame_time.as_secs(),
        multiplier,
        "production computed"
    );

    ProductionValues {
        frame_time,
        unit_time,
        bonus_multiplier: multiplier,
        credit,
        upd,
        ppd: upd * credit,
    }
}
