//! Per-run parameters and their validation.

use std::num::NonZeroUsize;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use thiserror::Error;

use super::CleanupSettings;

/// A rejected run parameter. The message is meant for the caller as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("`days` must be a non-negative integer.")]
    Days,
    #[error("`chunk_size` must be a positive integer.")]
    ChunkSize,
    #[error("`dry_run` must be a boolean.")]
    DryRun,
}

/// Raw on-demand overrides as they arrive from a request's query string.
///
/// Missing and empty values both mean "use the default".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunRequest {
    pub days: Option<String>,
    pub chunk_size: Option<String>,
    pub dry_run: Option<String>,
}

/// Validated parameters for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunParameters {
    pub threshold_days: u32,
    pub chunk_size: NonZeroUsize,
    pub dry_run: bool,
}

impl RunParameters {
    /// Parameters for a scheduled run: configured defaults, never a dry run.
    #[must_use]
    pub fn scheduled(settings: &CleanupSettings) -> Self {
        Self {
            threshold_days: settings.threshold_days,
            chunk_size: settings.chunk_size,
            dry_run: false,
        }
    }

    /// Build parameters from typed values, rejecting negative days and
    /// non-positive chunk sizes.
    ///
    /// # Errors
    ///
    /// Returns the first invalid parameter.
    pub fn new(threshold_days: i64, chunk_size: i64, dry_run: bool) -> Result<Self, ValidationError> {
        let threshold_days = u32::try_from(threshold_days).map_err(|_| ValidationError::Days)?;
        let chunk_size = usize::try_from(chunk_size)
            .ok()
            .and_then(NonZeroUsize::new)
            .ok_or(ValidationError::ChunkSize)?;
        Ok(Self {
            threshold_days,
            chunk_size,
            dry_run,
        })
    }

    /// Resolve an on-demand request against the configured defaults.
    ///
    /// # Errors
    ///
    /// Returns the first invalid parameter, checked in the order `days`,
    /// `chunk_size`, `dry_run`.
    pub fn from_request(
        request: &RunRequest,
        settings: &CleanupSettings,
    ) -> Result<Self, ValidationError> {
        let threshold_days = match present(request.days.as_deref()) {
            Some(raw) => raw.parse::<i64>().map_err(|_| ValidationError::Days)?,
            None => i64::from(settings.threshold_days),
        };
        let chunk_size = match present(request.chunk_size.as_deref()) {
            Some(raw) => raw.parse::<i64>().map_err(|_| ValidationError::ChunkSize)?,
            None => i64::try_from(settings.chunk_size.get()).unwrap_or(i64::MAX),
        };
        let dry_run = match present(request.dry_run.as_deref()) {
            Some(raw) => parse_bool(raw).ok_or(ValidationError::DryRun)?,
            None => false,
        };
        Self::new(threshold_days, chunk_size, dry_run)
    }

    /// Users last active before this instant are candidates.
    #[must_use]
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(ChronoDuration::days(i64::from(self.threshold_days)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
