//! Generic finite-state-machine engine
//!
//! A [`Machine`] declares its states, events and the labels of its guards,
//! emits and inline actions. Its [`Definition`] is a static transition table
//! built once per process. A [`StateEngine`] holds the current state and
//! executes transitions, delegating every side effect to a [`Hooks`]
//! implementation supplied by the owning component.
//!
//! Execution order of [`StateEngine::send`]:
//!
//! 1. look up `(current, event)`; no entry means the event is ignored
//! 2. evaluate the guard, if any; a blocked guard leaves everything untouched
//! 3. on a state change: exit hook of the old state, swap, transition observer
//! 4. inline action
//! 5. on a state change: entry hook of the new state
//! 6. emit, strictly after the transition has committed
//!
//! Self-loops skip the entry and exit hooks and only run the inline action.

use core::fmt::{self, Debug};
use core::hash::Hash;
use hashbrown::HashMap;

use tracing::{debug, trace};

// ----------------------------------------------------------------------------
// Labels
// ----------------------------------------------------------------------------

/// Stable name of a state, event or effect label
pub trait Label: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    fn label(&self) -> &'static str;
}

impl Label for core::convert::Infallible {
    fn label(&self) -> &'static str {
        match *self {}
    }
}

/// Implement [`Label`] for a fieldless enum
macro_rules! impl_label {
    ($ty:ty { $($variant:ident => $label:literal),* $(,)? }) => {
        impl $crate::engine::Label for $ty {
            fn label(&self) -> &'static str {
                match self {
                    $(Self::$variant => $label),*
                }
            }
        }
    };
}

pub(crate) use impl_label;

// ----------------------------------------------------------------------------
// Machine Definition
// ----------------------------------------------------------------------------

/// Type-level description of one state machine
pub trait Machine: Sized + 'static {
    type State: Label;
    type Event: Label;
    /// Guard references checked through [`Hooks::check_guard`]
    type Guard: Label;
    /// Events dispatched into other machines through [`Hooks::on_emit`]
    type Emit: Label;
    /// Inline side effects run through [`Hooks::on_action`]
    type Action: Label;

    const NAME: &'static str;

    /// The machine's static transition table
    fn definition() -> &'static Definition<Self>;
}

/// One row of a transition table
pub struct TransitionDef<M: Machine> {
    pub id: &'static str,
    pub from: M::State,
    pub event: M::Event,
    pub target: M::State,
    pub guard: Option<M::Guard>,
    pub emit: Option<M::Emit>,
    pub action: Option<M::Action>,
    /// Operator-triggered rather than protocol-triggered
    pub manual: bool,
}

impl<M: Machine> TransitionDef<M> {
    pub fn new(id: &'static str, from: M::State, event: M::Event, target: M::State) -> Self {
        Self {
            id,
            from,
            event,
            target,
            guard: None,
            emit: None,
            action: None,
            manual: false,
        }
    }

    pub fn guard(mut self, guard: M::Guard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn emit(mut self, emit: M::Emit) -> Self {
        self.emit = Some(emit);
        self
    }

    pub fn action(mut self, action: M::Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    pub fn is_self_loop(&self) -> bool {
        self.from == self.target
    }
}

impl<M: Machine> Debug for TransitionDef<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionDef")
            .field("id", &self.id)
            .field("from", &self.from)
            .field("event", &self.event)
            .field("target", &self.target)
            .field("guard", &self.guard)
            .field("emit", &self.emit)
            .field("action", &self.action)
            .field("manual", &self.manual)
            .finish()
    }
}

/// Structural problems in a transition table
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    #[error("{machine}: initial state {state} is not declared")]
    UndeclaredInitial { machine: &'static str, state: &'static str },
    #[error("{machine}: transition {id} targets undeclared state {state}")]
    UndeclaredTarget {
        machine: &'static str,
        id: &'static str,
        state: &'static str,
    },
    #[error("{machine}: transition {id} starts from undeclared state {state}")]
    UndeclaredSource {
        machine: &'static str,
        id: &'static str,
        state: &'static str,
    },
    #[error("{machine}: duplicate transition for ({state}, {event})")]
    Duplicate {
        machine: &'static str,
        state: &'static str,
        event: &'static str,
    },
}

/// Static transition table of a machine
pub struct Definition<M: Machine> {
    initial: M::State,
    states: Vec<M::State>,
    rows: Vec<TransitionDef<M>>,
    index: HashMap<(M::State, M::Event), usize>,
    duplicates: Vec<(M::State, M::Event)>,
}

impl<M: Machine> Definition<M> {
    pub fn new(initial: M::State, states: &[M::State]) -> Self {
        Self {
            initial,
            states: states.to_vec(),
            rows: Vec::new(),
            index: HashMap::new(),
            duplicates: Vec::new(),
        }
    }

    /// Append a transition row
    pub fn with(mut self, row: TransitionDef<M>) -> Self {
        let key = (row.from, row.event);
        if self.index.contains_key(&key) {
            self.duplicates.push(key);
        } else {
            self.index.insert(key, self.rows.len());
        }
        self.rows.push(row);
        self
    }

    pub fn initial(&self) -> M::State {
        self.initial
    }

    pub fn states(&self) -> &[M::State] {
        &self.states
    }

    pub fn transitions(&self) -> &[TransitionDef<M>] {
        &self.rows
    }

    pub fn is_declared(&self, state: M::State) -> bool {
        self.states.contains(&state)
    }

    /// Transition for `(state, event)`, if any
    pub fn lookup(&self, state: M::State, event: M::Event) -> Option<&TransitionDef<M>> {
        self.index.get(&(state, event)).map(|&i| &self.rows[i])
    }

    /// Transition by stable id
    pub fn by_id(&self, id: &str) -> Option<&TransitionDef<M>> {
        self.rows.iter().find(|row| row.id == id)
    }

    /// Check every referenced state is declared and every key is unique
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if !self.is_declared(self.initial) {
            return Err(DefinitionError::UndeclaredInitial {
                machine: M::NAME,
                state: self.initial.label(),
            });
        }
        if let Some((state, event)) = self.duplicates.first() {
            return Err(DefinitionError::Duplicate {
                machine: M::NAME,
                state: state.label(),
                event: event.label(),
            });
        }
        for row in &self.rows {
            if !self.is_declared(row.from) {
                return Err(DefinitionError::UndeclaredSource {
                    machine: M::NAME,
                    id: row.id,
                    state: row.from.label(),
                });
            }
            if !self.is_declared(row.target) {
                return Err(DefinitionError::UndeclaredTarget {
                    machine: M::NAME,
                    id: row.id,
                    state: row.target.label(),
                });
            }
        }
        Ok(())
    }

    /// Render the table as a Mermaid flowchart
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("flowchart LR\n");
        out.push_str(&format!("    start(( )) --> {}\n", self.initial.label()));
        for row in &self.rows {
            let mut label = format!("{} {}", row.event.label(), row.id);
            if let Some(guard) = row.guard {
                label.push_str(&format!(" [{}]", guard.label()));
            }
            if let Some(emit) = row.emit {
                label.push_str(&format!(" / {}", emit.label()));
            }
            if let Some(action) = row.action {
                label.push_str(&format!(" / {}", action.label()));
            }
            let arrow = if row.manual { "-.->" } else { "-->" };
            out.push_str(&format!(
                "    {} {}|\"{}\"| {}\n",
                row.from.label(),
                arrow,
                label,
                row.target.label()
            ));
        }
        out
    }
}

impl<M: Machine> Debug for Definition<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Definition")
            .field("machine", &M::NAME)
            .field("initial", &self.initial)
            .field("transitions", &self.rows.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Hooks
// ----------------------------------------------------------------------------

/// A committed transition, as seen by observers
pub struct TransitionRecord<M: Machine> {
    pub id: &'static str,
    pub from: M::State,
    pub to: M::State,
    pub event: M::Event,
}

impl<M: Machine> Clone for TransitionRecord<M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M: Machine> Copy for TransitionRecord<M> {}

impl<M: Machine> PartialEq for TransitionRecord<M> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.from == other.from
            && self.to == other.to
            && self.event == other.event
    }
}

impl<M: Machine> Debug for TransitionRecord<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} --[{}]--> {}",
            self.id,
            self.from.label(),
            self.event.label(),
            self.to.label()
        )
    }
}

impl<M: Machine> TransitionRecord<M> {
    pub fn is_self_loop(&self) -> bool {
        self.from == self.to
    }
}

/// Side-effect interface of a machine's owner
///
/// Every method defaults to a no-op (guards default to permitting).
pub trait Hooks<M: Machine> {
    fn check_guard(&mut self, guard: M::Guard) -> bool {
        let _ = guard;
        true
    }

    fn on_exit(&mut self, state: M::State, record: &TransitionRecord<M>) {
        let _ = (state, record);
    }

    fn on_transition(&mut self, record: &TransitionRecord<M>) {
        let _ = record;
    }

    fn on_action(&mut self, action: M::Action, record: &TransitionRecord<M>) {
        let _ = (action, record);
    }

    fn on_entry(&mut self, state: M::State, record: &TransitionRecord<M>) {
        let _ = (state, record);
    }

    fn on_emit(&mut self, emit: M::Emit, record: &TransitionRecord<M>) {
        let _ = (emit, record);
    }
}

/// Hooks that do nothing and permit every guard
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl<M: Machine> Hooks<M> for NoHooks {}

// ----------------------------------------------------------------------------
// State Engine
// ----------------------------------------------------------------------------

/// Runner holding the current state of one machine instance
pub struct StateEngine<M: Machine> {
    definition: &'static Definition<M>,
    current: M::State,
}

impl<M: Machine> StateEngine<M> {
    pub fn new() -> Self {
        let definition = M::definition();
        Self {
            definition,
            current: definition.initial(),
        }
    }

    pub fn state(&self) -> M::State {
        self.current
    }

    pub fn is(&self, state: M::State) -> bool {
        self.current == state
    }

    pub fn definition(&self) -> &'static Definition<M> {
        self.definition
    }

    /// Whether `event` has a transition from the current state (guards not evaluated)
    pub fn accepts(&self, event: M::Event) -> bool {
        self.definition.lookup(self.current, event).is_some()
    }

    /// Feed an event; returns whether a transition was taken
    pub fn send<H: Hooks<M> + ?Sized>(&mut self, event: M::Event, hooks: &mut H) -> bool {
        let from = self.current;
        let Some(row) = self.definition.lookup(from, event) else {
            trace!(
                machine = M::NAME,
                state = from.label(),
                event = event.label(),
                "event ignored"
            );
            return false;
        };

        if !self.definition.is_declared(row.target) {
            trace!(machine = M::NAME, id = row.id, "target state not declared");
            return false;
        }

        if let Some(guard) = row.guard {
            if !hooks.check_guard(guard) {
                debug!(
                    machine = M::NAME,
                    id = row.id,
                    guard = guard.label(),
                    "transition blocked by guard"
                );
                return false;
            }
        }

        let record = TransitionRecord {
            id: row.id,
            from,
            to: row.target,
            event,
        };
        let changed = !record.is_self_loop();

        if changed {
            hooks.on_exit(from, &record);
            self.current = row.target;
            debug!(
                machine = M::NAME,
                id = row.id,
                "{} --[{}]--> {}",
                from.label(),
                event.label(),
                row.target.label()
            );
            hooks.on_transition(&record);
        } else {
            trace!(
                machine = M::NAME,
                id = row.id,
                state = from.label(),
                event = event.label(),
                "self-loop"
            );
        }

        if let Some(action) = row.action {
            hooks.on_action(action, &record);
        }

        if changed {
            hooks.on_entry(row.target, &record);
        }

        if let Some(emit) = row.emit {
            hooks.on_emit(emit, &record);
        }

        true
    }
}

impl<M: Machine> Default for StateEngine<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Machine> Debug for StateEngine<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateEngine")
            .field("machine", &M::NAME)
            .field("state", &self.current.label())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::OnceLock;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Light {
        Off,
        On,
        Broken,
    }

    impl_label!(Light { Off => "OFF", On => "ON", Broken => "BROKEN" });

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Press {
        Toggle,
        Tap,
        Smash,
        Repair,
    }

    impl_label!(Press { Toggle => "TOGGLE", Tap => "TAP", Smash => "SMASH", Repair => "REPAIR" });

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum PowerGuard {
        HasPower,
    }

    impl_label!(PowerGuard { HasPower => "hasPower" });

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Notify {
        Alarm,
    }

    impl_label!(Notify { Alarm => "alarm" });

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Blink {
        Flash,
    }

    impl_label!(Blink { Flash => "flash" });

    struct Lamp;

    impl Machine for Lamp {
        type State = Light;
        type Event = Press;
        type Guard = PowerGuard;
        type Emit = Notify;
        type Action = Blink;

        const NAME: &'static str = "lamp";

        fn definition() -> &'static Definition<Self> {
            static DEFINITION: OnceLock<Definition<Lamp>> = OnceLock::new();
            DEFINITION.get_or_init(|| {
                Definition::new(Light::Off, &[Light::Off, Light::On, Light::Broken])
                    .with(TransitionDef::new("l1", Light::Off, Press::Toggle, Light::On).guard(PowerGuard::HasPower))
                    .with(TransitionDef::new("l2", Light::On, Press::Toggle, Light::Off))
                    .with(TransitionDef::new("l3", Light::On, Press::Tap, Light::On).action(Blink::Flash))
                    .with(TransitionDef::new("l4", Light::On, Press::Smash, Light::Broken).emit(Notify::Alarm))
                    .with(TransitionDef::new("l5", Light::Broken, Press::Repair, Light::Off).manual())
            })
        }
    }

    #[derive(Default)]
    struct Recorder {
        power: bool,
        log: Vec<String>,
        seen_state_at_emit: Option<Light>,
    }

    impl Hooks<Lamp> for Recorder {
        fn check_guard(&mut self, guard: PowerGuard) -> bool {
            self.log.push(format!("guard:{}", guard.label()));
            self.power
        }

        fn on_exit(&mut self, state: Light, _record: &TransitionRecord<Lamp>) {
            self.log.push(format!("exit:{}", state.label()));
        }

        fn on_transition(&mut self, record: &TransitionRecord<Lamp>) {
            self.log.push(format!("transition:{}", record.id));
        }

        fn on_action(&mut self, action: Blink, _record: &TransitionRecord<Lamp>) {
            self.log.push(format!("action:{}", action.label()));
        }

        fn on_entry(&mut self, state: Light, _record: &TransitionRecord<Lamp>) {
            self.log.push(format!("entry:{}", state.label()));
        }

        fn on_emit(&mut self, emit: Notify, record: &TransitionRecord<Lamp>) {
            self.seen_state_at_emit = Some(record.to);
            self.log.push(format!("emit:{}", emit.label()));
        }
    }

    #[test]
    fn test_definition_is_valid() {
        assert!(Lamp::definition().validate().is_ok());
        assert_eq!(Lamp::definition().by_id("l4").map(|t| t.target), Some(Light::Broken));
    }

    #[test]
    fn test_guard_blocks_without_side_effects() {
        let mut engine = StateEngine::<Lamp>::new();
        let mut hooks = Recorder::default();
        assert!(!engine.send(Press::Toggle, &mut hooks));
        assert_eq!(engine.state(), Light::Off);
        assert_eq!(hooks.log, vec!["guard:hasPower"]);
    }

    #[test]
    fn test_hook_order_on_state_change() {
        let mut engine = StateEngine::<Lamp>::new();
        let mut hooks = Recorder {
            power: true,
            ..Default::default()
        };
        assert!(engine.send(Press::Toggle, &mut hooks));
        assert_eq!(
            hooks.log,
            vec!["guard:hasPower", "exit:OFF", "transition:l1", "entry:ON"]
        );
    }

    #[test]
    fn test_self_loop_skips_entry_and_exit() {
        let mut engine = StateEngine::<Lamp>::new();
        let mut hooks = Recorder {
            power: true,
            ..Default::default()
        };
        engine.send(Press::Toggle, &mut hooks);
        hooks.log.clear();
        assert!(engine.send(Press::Tap, &mut hooks));
        assert_eq!(hooks.log, vec!["action:flash"]);
        assert_eq!(engine.state(), Light::On);
    }

    #[test]
    fn test_emit_after_commit() {
        let mut engine = StateEngine::<Lamp>::new();
        let mut hooks = Recorder {
            power: true,
            ..Default::default()
        };
        engine.send(Press::Toggle, &mut hooks);
        hooks.log.clear();
        assert!(engine.send(Press::Smash, &mut hooks));
        assert_eq!(hooks.seen_state_at_emit, Some(Light::Broken));
        assert_eq!(
            hooks.log,
            vec!["exit:ON", "transition:l4", "entry:BROKEN", "emit:alarm"]
        );
    }

    #[test]
    fn test_mermaid_export() {
        let chart = Lamp::definition().to_mermaid();
        assert!(chart.starts_with("flowchart LR"));
        assert!(chart.contains("OFF -->|\"TOGGLE l1 [hasPower]\"| ON"));
        assert!(chart.contains("BROKEN -.->|\"REPAIR l5\"| OFF"));
    }

    fn any_press() -> impl Strategy<Value = Press> {
        prop_oneof![
            Just(Press::Toggle),
            Just(Press::Tap),
            Just(Press::Smash),
            Just(Press::Repair)
        ]
    }

    proptest! {
        #[test]
        fn prop_unknown_events_never_mutate(events in proptest::collection::vec(any_press(), 0..40), power in any::<bool>()) {
            let mut engine = StateEngine::<Lamp>::new();
            let mut hooks = Recorder { power, ..Default::default() };
            for event in events {
                let before = engine.state();
                let known = Lamp::definition().lookup(before, event).is_some();
                let log_len = hooks.log.len();
                let moved = engine.send(event, &mut hooks);
                if !known {
                    prop_assert!(!moved);
                    prop_assert_eq!(engine.state(), before);
                    prop_assert_eq!(hooks.log.len(), log_len);
                }
                if moved {
                    let row = Lamp::definition().lookup(before, event).map(|r| r.target);
                    prop_assert_eq!(Some(engine.state()), row);
                }
            }
        }
    }
}
