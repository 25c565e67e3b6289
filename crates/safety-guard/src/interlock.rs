use crate::types::{SafetyEvent, SafetyEventType, SafetyViolation};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

type EventCallback = Box<dyn Fn(SafetyEvent) + Send + Sync>;

/// True for commands that change hardware state.
pub fn is_mutating(command: &str) -> bool {
    command
        .get(..3)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("set"))
}

/// Safe-mode switch consulted before every dispatch.
pub struct SafetyInterlock {
    engaged: AtomicBool,
    event_callback: RwLock<Option<EventCallback>>,
}

impl SafetyInterlock {
    pub fn new(engaged: bool) -> Self {
        Self {
            engaged: AtomicBool::new(engaged),
            event_callback: RwLock::new(None),
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }

    pub fn set_engaged(&self, engaged: bool) {
        let was = self.engaged.swap(engaged, Ordering::SeqCst);
        if was == engaged {
            return;
        }
        let (kind, message) = if engaged {
            (SafetyEventType::Engaged, "safe mode engaged".to_string())
        } else {
            (SafetyEventType::Released, "safe mode released".to_string())
        };
        tracing::warn!(engaged, "{message}");
        self.emit(SafetyEvent::now(kind, message));
    }

    /// Refuse `command` if it is mutating and safe mode is engaged.
    pub fn check(&self, command: &str) -> Result<(), SafetyViolation> {
        if self.is_engaged() && is_mutating(command) {
            tracing::warn!(command, "interlock blocked command");
            self.emit(SafetyEvent::now(
                SafetyEventType::CommandBlocked,
                format!("blocked `{command}`"),
            ));
            return Err(SafetyViolation::Blocked {
                command: command.to_string(),
            });
        }
        Ok(())
    }

    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: Fn(SafetyEvent) + Send + Sync + 'static,
    {
        *self.event_callback.write() = Some(Box::new(callback));
    }

    fn emit(&self, event: SafetyEvent) {
        if let Some(callback) = self.event_callback.read().as_ref() {
            callback(event);
        }
    }
}

impl Default for SafetyInterlock {
    /// Engaged: hardware stays untouched until an operator opts in.
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_mutating_prefix_is_case_insensitive() {
        assert!(is_mutating("setLoad"));
        assert!(is_mutating("SETPOINT"));
        assert!(is_mutating("set"));
        assert!(!is_mutating("readAll"));
        assert!(!is_mutating("se"));
        assert!(!is_mutating("reset"));
    }

    #[test]
    fn test_engaged_blocks_only_setters() {
        let guard = SafetyInterlock::new(true);
        assert_eq!(
            guard.check("setLoad"),
            Err(SafetyViolation::Blocked {
                command: "setLoad".to_string()
            })
        );
        assert!(guard.check("getVoltage").is_ok());
    }

    #[test]
    fn test_released_allows_setters() {
        let guard = SafetyInterlock::new(false);
        assert!(guard.check("setLoad").is_ok());
    }

    #[test]
    fn test_events_reported_on_toggle_and_block() {
        let guard = SafetyInterlock::new(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        guard.set_event_callback(move |e| sink.lock().unwrap().push(e.event_type));

        guard.set_engaged(true);
        guard.set_engaged(true);
        let _ = guard.check("setFan");
        guard.set_engaged(false);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                SafetyEventType::Engaged,
                SafetyEventType::CommandBlocked,
                SafetyEventType::Released
            ]
        );
    }

    #[test]
    fn test_event_serializes_with_rfc3339_timestamp() {
        let event = SafetyEvent::now(SafetyEventType::Engaged, "on".into());
        let json = serde_json::to_value(&event).unwrap();
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
    }
}
