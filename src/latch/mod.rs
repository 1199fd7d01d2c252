//! Named one-shot broadcast signals.
//!
//! # Responsibilities
//! - Track a set of named flags, each either unset or set with a payload
//! - Dispatch on-fire handlers once per epoch, in registration order
//! - Replay the stored payload to handlers registered after a flag fired
//! - Dispatch on-reset handlers on the set → unset transition
//!
//! # Data Flow
//! ```text
//! register("a b", h) ──▶ Flag(a).on_fire += h ──▶ Set? ──▶ h(payload) now
//!                        Flag(b).on_fire += h
//!
//! fire("a", p) ──▶ Unset? ──▶ state = Set(p) ──▶ every on_fire(p), in order
//! reset("a")   ──▶ Set?   ──▶ state = Unset  ──▶ every on_reset(), in order
//! ```
//!
//! # Design Decisions
//! - Not thread-safe: a latch is owned by the single task driving a session
//! - Handlers are plain synchronous closures; they schedule work, never await
//! - Every handler runs even when an earlier one fails; the first failure is
//!   reported once dispatch is complete

use std::collections::HashMap;
use std::sync::Arc;

/// Error returned by a latch handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a single handler invocation.
pub type HandlerResult = Result<(), HandlerError>;

type FireHandler<P> = Arc<dyn Fn(&P) -> HandlerResult + Send + Sync>;
type ResetHandler = Arc<dyn Fn() -> HandlerResult + Send + Sync>;

/// Identifies a registered handler so it can be unregistered later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Errors surfaced by latch dispatch.
#[derive(Debug, thiserror::Error)]
pub enum LatchError {
    #[error("handler {handler:?} for flag `{flag}` failed: {source}")]
    Handler {
        flag: String,
        handler: HandlerId,
        #[source]
        source: HandlerError,
    },
}

#[derive(Debug, Clone)]
enum FlagState<P> {
    Unset,
    Set(P),
}

struct Flag<P> {
    state: FlagState<P>,
    on_fire: Vec<(HandlerId, FireHandler<P>)>,
    on_reset: Vec<(HandlerId, ResetHandler)>,
}

impl<P> Flag<P> {
    fn new() -> Self {
        Self {
            state: FlagState::Unset,
            on_fire: Vec::new(),
            on_reset: Vec::new(),
        }
    }

    fn is_set(&self) -> bool {
        matches!(self.state, FlagState::Set(_))
    }

    fn is_idle(&self) -> bool {
        !self.is_set() && self.on_fire.is_empty() && self.on_reset.is_empty()
    }
}

/// A set of named one-shot flags with replay to late subscribers.
///
/// Flag names are passed as space-delimited strings, so one call can address
/// several flags: `latch.register("completed error", handler)`.
pub struct Latch<P> {
    flags: HashMap<String, Flag<P>>,
    next_handler: u64,
}

impl<P> Latch<P> {
    /// Create an empty latch.
    pub fn new() -> Self {
        Self {
            flags: HashMap::new(),
            next_handler: 1,
        }
    }

    /// Register `handler` to run when any of `names` fires.
    ///
    /// For every named flag that is already set, the handler runs immediately
    /// with the stored payload. The handler stays registered even if that
    /// replay fails.
    pub fn register<F>(&mut self, names: &str, handler: F) -> Result<HandlerId, LatchError>
    where
        F: Fn(&P) -> HandlerResult + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        let handler: FireHandler<P> = Arc::new(handler);
        let mut first_error = None;

        for name in names.split_whitespace() {
            let flag = self.flags.entry(name.to_string()).or_insert_with(Flag::new);
            flag.on_fire.push((id, Arc::clone(&handler)));

            if let FlagState::Set(payload) = &flag.state {
                if let Err(source) = handler(payload) {
                    first_error.get_or_insert(LatchError::Handler {
                        flag: name.to_string(),
                        handler: id,
                        source,
                    });
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(id),
        }
    }

    /// Register `handler` to run on every set → unset transition of `names`.
    ///
    /// Unlike [`Latch::register`] nothing is replayed: the handler only runs
    /// when a later [`Latch::reset`] actually clears a set flag.
    pub fn register_reset<F>(&mut self, names: &str, handler: F) -> HandlerId
    where
        F: Fn() -> HandlerResult + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        let handler: ResetHandler = Arc::new(handler);

        for name in names.split_whitespace() {
            let flag = self.flags.entry(name.to_string()).or_insert_with(Flag::new);
            flag.on_reset.push((id, Arc::clone(&handler)));
        }

        id
    }

    /// Fire `name` with `payload`.
    ///
    /// Returns `Ok(false)` without invoking anything if the flag is already
    /// set. Otherwise stores the payload and invokes every on-fire handler in
    /// registration order.
    pub fn fire(&mut self, name: &str, payload: P) -> Result<bool, LatchError> {
        let flag = self.flags.entry(name.to_string()).or_insert_with(Flag::new);
        if flag.is_set() {
            return Ok(false);
        }

        let mut first_error = None;
        for (id, handler) in &flag.on_fire {
            if let Err(source) = handler(&payload) {
                first_error.get_or_insert(LatchError::Handler {
                    flag: name.to_string(),
                    handler: *id,
                    source,
                });
            }
        }
        flag.state = FlagState::Set(payload);

        match first_error {
            Some(err) => Err(err),
            None => Ok(true),
        }
    }

    /// Clear `name` if it is set and invoke its on-reset handlers.
    ///
    /// Returns `Ok(false)` if the flag was not set.
    pub fn reset(&mut self, name: &str) -> Result<bool, LatchError> {
        let Some(flag) = self.flags.get_mut(name) else {
            return Ok(false);
        };
        if !flag.is_set() {
            return Ok(false);
        }

        flag.state = FlagState::Unset;

        let mut first_error = None;
        for (id, handler) in &flag.on_reset {
            if let Err(source) = handler() {
                first_error.get_or_insert(LatchError::Handler {
                    flag: name.to_string(),
                    handler: *id,
                    source,
                });
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(true),
        }
    }

    /// Remove `handler` from both handler lists of every flag in `names`.
    ///
    /// Flags left with no handlers and no payload are dropped.
    pub fn unregister(&mut self, names: &str, handler: HandlerId) {
        for name in names.split_whitespace() {
            let Some(flag) = self.flags.get_mut(name) else {
                continue;
            };

            flag.on_fire.retain(|(id, _)| *id != handler);
            flag.on_reset.retain(|(id, _)| *id != handler);

            if flag.is_idle() {
                self.flags.remove(name);
            }
        }
    }

    /// Whether `name` is currently set.
    pub fn is_set(&self, name: &str) -> bool {
        self.flags.get(name).is_some_and(Flag::is_set)
    }

    /// The payload `name` was fired with, if it is currently set.
    pub fn payload(&self, name: &str) -> Option<&P> {
        match &self.flags.get(name)?.state {
            FlagState::Set(payload) => Some(payload),
            FlagState::Unset => None,
        }
    }

    fn allocate_id(&mut self) -> HandlerId {
        let id = HandlerId(self.next_handler);
        self.next_handler += 1;
        id
    }
}

impl<P> Default for Latch<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> std::fmt::Debug for Latch<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self
            .flags
            .iter()
            .map(|(name, flag)| (name.as_str(), flag.is_set()))
            .collect();
        names.sort_unstable();
        f.debug_struct("Latch").field("flags", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn fire_runs_handlers_once() {
        let mut latch = Latch::new();
        let log = recorder();

        let sink = log.clone();
        latch
            .register("done", move |p: &u32| {
                sink.lock().unwrap().push(format!("done:{p}"));
                Ok(())
            })
            .unwrap();

        assert!(latch.fire("done", 7).unwrap());
        assert!(!latch.fire("done", 8).unwrap());

        assert_eq!(*log.lock().unwrap(), vec!["done:7"]);
        assert_eq!(latch.payload("done"), Some(&7));
    }

    #[test]
    fn late_registration_replays_original_payload() {
        let mut latch = Latch::new();
        latch.fire("ready", "first".to_string()).unwrap();
        latch.fire("ready", "second".to_string()).unwrap();

        let log = recorder();
        let sink = log.clone();
        latch
            .register("ready", move |p: &String| {
                sink.lock().unwrap().push(p.clone());
                Ok(())
            })
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["first"]);
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let mut latch = Latch::new();
        let log = recorder();

        for tag in ["a", "b", "c"] {
            let sink = log.clone();
            latch
                .register("go", move |_: &()| {
                    sink.lock().unwrap().push(tag.to_string());
                    Ok(())
                })
                .unwrap();
        }

        latch.fire("go", ()).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn failing_handler_does_not_skip_others() {
        let mut latch = Latch::new();
        let log = recorder();

        latch
            .register("go", |_: &()| Err("first failure".into()))
            .unwrap();
        latch
            .register("go", |_: &()| Err("second failure".into()))
            .unwrap();
        let sink = log.clone();
        latch
            .register("go", move |_: &()| {
                sink.lock().unwrap().push("ran".to_string());
                Ok(())
            })
            .unwrap();

        let err = latch.fire("go", ()).unwrap_err();
        assert!(err.to_string().contains("first failure"));
        assert_eq!(*log.lock().unwrap(), vec!["ran"]);
        assert!(latch.is_set("go"));
    }

    #[test]
    fn one_handler_for_several_names() {
        let mut latch = Latch::new();
        let log = recorder();
        let sink = log.clone();

        latch
            .register("completed error", move |p: &&str| {
                sink.lock().unwrap().push(p.to_string());
                Ok(())
            })
            .unwrap();

        latch.fire("error", "boom").unwrap();
        latch.fire("completed", "ok").unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["boom", "ok"]);
    }

    #[test]
    fn reset_starts_a_new_epoch() {
        let mut latch = Latch::new();
        let log = recorder();

        let sink = log.clone();
        latch
            .register("flag", move |p: &u8| {
                sink.lock().unwrap().push(format!("fire:{p}"));
                Ok(())
            })
            .unwrap();
        let sink = log.clone();
        latch.register_reset("flag", move || {
            sink.lock().unwrap().push("reset".to_string());
            Ok(())
        });

        assert!(!latch.reset("flag").unwrap());
        latch.fire("flag", 1).unwrap();
        assert!(latch.reset("flag").unwrap());
        assert!(!latch.reset("flag").unwrap());
        assert!(!latch.is_set("flag"));
        latch.fire("flag", 2).unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["fire:1", "reset", "fire:2"]);
    }

    #[test]
    fn reset_handler_is_not_replayed() {
        let mut latch: Latch<()> = Latch::new();
        let log = recorder();
        let sink = log.clone();

        latch.register_reset("idle", move || {
            sink.lock().unwrap().push("reset".to_string());
            Ok(())
        });

        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn unregister_removes_from_both_lists() {
        let mut latch = Latch::new();
        let log = recorder();

        let sink = log.clone();
        let id = latch
            .register("x y", move |_: &()| {
                sink.lock().unwrap().push("fired".to_string());
                Ok(())
            })
            .unwrap();

        latch.unregister("x y", id);
        latch.fire("x", ()).unwrap();
        latch.fire("y", ()).unwrap();

        assert!(log.lock().unwrap().is_empty());
        assert!(latch.is_set("x"));
    }

    #[test]
    fn unregister_keeps_fired_state() {
        let mut latch = Latch::new();
        let id = latch.register("done", |_: &()| Ok(())).unwrap();
        latch.fire("done", ()).unwrap();
        latch.unregister("done", id);
        assert!(latch.is_set("done"));
        assert!(!latch.is_set("never"));
    }
}
