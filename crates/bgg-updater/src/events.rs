// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of BGG Updater.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Update event reporting and device status signalling

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub enum UpdateEvent {
    UpdateStaged {
        version: String,
        files: usize,
    },
    PromotionStarted {
        from_version: String,
        to_version: String,
    },
    PromotionCompleted {
        version: String,
    },
    PromotionFailed {
        version: String,
        error: String,
    },
    RollbackStarted {
        version: String,
    },
    RollbackCompleted {
        restored_version: String,
    },
    RollbackFailed {
        version: String,
        error: String,
    },
}

/// Report an update event.
///
/// Fire-and-forget: serialization problems are logged and never block or
/// fail the update flow.
pub fn report_event(event: &UpdateEvent) {
    match serde_json::to_string(event) {
        Ok(json) => tracing::info!("Update event: {json}"),
        Err(e) => tracing::warn!("Could not serialize update event: {e}"),
    }
}

/// Device-visible status signalling, wired to the controller's LED chain by
/// the surrounding firmware.
pub trait StatusIndicator: Send + Sync {
    /// Steady pattern for normal operation
    fn normal(&self);

    /// Pattern shown while staged files are being promoted
    fn updating(&self);

    /// An update attempt failed; the device keeps running its previous
    /// firmware
    fn update_failed(&self);

    /// Recovery pattern: the active set can no longer be trusted and the
    /// device must not enter normal operation
    fn recovery(&self);
}

/// Fallback indicator that only logs; hardware builds plug the LED driver
/// in here.
#[derive(Debug, Default)]
pub struct LogIndicator;

impl StatusIndicator for LogIndicator {
    fn normal(&self) {
        tracing::debug!("Status indicator: normal");
    }

    fn updating(&self) {
        tracing::info!("Status indicator: updating");
    }

    fn update_failed(&self) {
        tracing::warn!("Status indicator: update failed");
    }

    fn recovery(&self) {
        tracing::error!("Status indicator: RECOVERY - device needs service");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = UpdateEvent::PromotionStarted {
            from_version: "3.0".to_string(),
            to_version: "3.1".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("PromotionStarted"));
        assert!(json.contains("3.0"));
        assert!(json.contains("3.1"));
    }

    #[test]
    fn test_rollback_event_serialization() {
        let event = UpdateEvent::RollbackCompleted {
            restored_version: "3.0".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("RollbackCompleted"));
    }

    #[test]
    fn test_report_event_never_panics() {
        report_event(&UpdateEvent::UpdateStaged {
            version: "3.1".to_string(),
            files: 8,
        });
    }

    #[test]
    fn test_log_indicator_is_usable_as_trait_object() {
        let indicator: &dyn StatusIndicator = &LogIndicator;
        indicator.normal();
        indicator.updating();
        indicator.update_failed();
        indicator.recovery();
    }
}
