//! Finite State Machine Engine
//!
//! Generic, table-driven state machine used by the connectivity and
//! download workflows.
//!
//! # Model
//!
//! - A [`MachineDefinition`] is an immutable transition table built and
//!   validated once through [`DefinitionBuilder`], then shared via `Arc`.
//! - A [`StateMachine`] is one running instance: a definition plus the
//!   current state.
//! - Events are typed enums implementing [`Signal`]; the table is keyed on
//!   the payload-free [`Signal::Kind`].
//! - Entry actions live in an [`EntryActions`] implementation, usually an
//!   exhaustive `match` over the state enum.
//!
//! # Dispatch
//!
//! `fire` is run-to-completion: entry actions push follow-up events into an
//! [`Outbox`], and the machine drains it in FIFO order before returning.
//! A `(state, event)` pair with no declared transition is ignored and
//! logged; the state never changes in that case.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

// =============================================================================
// Traits
// =============================================================================

/// Bound shared by state labels and event kinds.
pub trait Label: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> Label for T where T: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

/// An event with a typed payload.
pub trait Signal: Debug + Send {
    /// Payload-free discriminant used as the transition table key.
    type Kind: Label;

    /// Discriminant of this event.
    fn kind(&self) -> Self::Kind;
}

/// Per-state entry actions for one machine.
///
/// `trigger` is `None` when the initial state is entered by `start`.
pub trait EntryActions<S: Label, E: Signal> {
    /// Error returned by an entry action.
    type Error: From<FsmError>;

    /// Run the entry action for `state`.
    ///
    /// # Errors
    ///
    /// Returns an error if the action fails; dispatch stops at that point.
    fn on_entry(
        &mut self,
        state: S,
        trigger: Option<&E>,
        outbox: &mut Outbox<E>,
    ) -> Result<(), Self::Error>;
}

// =============================================================================
// Errors
// =============================================================================

/// Errors raised by the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FsmError {
    /// Event kind is not part of the machine's declared event domain.
    #[error("machine {machine}: event {event} is not declared")]
    InvalidEvent {
        /// Machine name.
        machine: &'static str,
        /// Offending event kind.
        event: String,
    },

    /// `fire` was called before `start`.
    #[error("machine {machine} has not been started")]
    NotStarted {
        /// Machine name.
        machine: &'static str,
    },

    /// `start` was called twice without a `reset`.
    #[error("machine {machine} is already started")]
    AlreadyStarted {
        /// Machine name.
        machine: &'static str,
    },

    /// Definition failed validation.
    #[error("machine {machine}: invalid definition: {reason}")]
    InvalidDefinition {
        /// Machine name.
        machine: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// An entry action could not run with the trigger it received.
    #[error("machine {machine}: entry action for {state} failed: {reason}")]
    EntryAction {
        /// Machine name.
        machine: &'static str,
        /// State whose action failed.
        state: String,
        /// Failure description.
        reason: String,
    },
}

impl FsmError {
    /// Build an [`FsmError::EntryAction`] for `state`.
    #[must_use]
    pub fn entry_action(machine: &'static str, state: impl Debug, reason: impl Into<String>) -> Self {
        Self::EntryAction {
            machine,
            state: format!("{state:?}"),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Definition
// =============================================================================

/// A declared `(from, on) -> to` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<S, K> {
    /// Source state.
    pub from: S,
    /// Triggering event kind.
    pub on: K,
    /// Target state.
    pub to: S,
}

/// Immutable, validated transition table.
#[derive(Debug)]
pub struct MachineDefinition<S: Label, K: Label> {
    name: &'static str,
    states: Vec<S>,
    events: HashSet<K>,
    table: HashMap<(S, K), S>,
    initial: S,
    terminal: HashSet<S>,
}

impl<S: Label, K: Label> MachineDefinition<S, K> {
    /// Start a builder for a machine called `name`.
    #[must_use]
    pub fn builder(name: &'static str) -> DefinitionBuilder<S, K> {
        DefinitionBuilder::new(name)
    }

    /// Machine name used in logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Declared states, in declaration order.
    #[must_use]
    pub fn states(&self) -> &[S] {
        &self.states
    }

    /// Initial state.
    #[must_use]
    pub const fn initial(&self) -> S {
        self.initial
    }

    /// Whether `state` is terminal.
    #[must_use]
    pub fn is_terminal(&self, state: S) -> bool {
        self.terminal.contains(&state)
    }

    /// Whether `event` is in the declared event domain.
    #[must_use]
    pub fn declares_event(&self, event: K) -> bool {
        self.events.contains(&event)
    }

    /// Target state for `(from, on)`, if declared.
    #[must_use]
    pub fn target(&self, from: S, on: K) -> Option<S> {
        self.table.get(&(from, on)).copied()
    }

    /// All declared transitions.
    pub fn transitions(&self) -> impl Iterator<Item = Transition<S, K>> + '_ {
        self.table
            .iter()
            .map(|(&(from, on), &to)| Transition { from, on, to })
    }
}

/// Builder for [`MachineDefinition`].
#[derive(Debug)]
pub struct DefinitionBuilder<S, K> {
    name: &'static str,
    states: Vec<S>,
    events: Vec<K>,
    transitions: Vec<Transition<S, K>>,
    initial: Option<S>,
    terminal: Vec<S>,
}

impl<S: Label, K: Label> DefinitionBuilder<S, K> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            states: Vec::new(),
            events: Vec::new(),
            transitions: Vec::new(),
            initial: None,
            terminal: Vec::new(),
        }
    }

    /// Declare the state set.
    #[must_use]
    pub fn states(mut self, states: impl IntoIterator<Item = S>) -> Self {
        self.states.extend(states);
        self
    }

    /// Declare the event domain.
    #[must_use]
    pub fn events(mut self, events: impl IntoIterator<Item = K>) -> Self {
        self.events.extend(events);
        self
    }

    /// Set the initial state.
    #[must_use]
    pub fn initial(mut self, state: S) -> Self {
        self.initial = Some(state);
        self
    }

    /// Mark a state as terminal.
    #[must_use]
    pub fn terminal(mut self, state: S) -> Self {
        self.terminal.push(state);
        self
    }

    /// Declare `from --on--> to`.
    #[must_use]
    pub fn transition(mut self, from: S, on: K, to: S) -> Self {
        self.transitions.push(Transition { from, on, to });
        self
    }

    /// Validate and freeze the definition.
    ///
    /// # Errors
    ///
    /// Returns [`FsmError::InvalidDefinition`] when the initial state is
    /// missing or undeclared, a transition references an undeclared state or
    /// event, a `(state, event)` pair maps to two targets, or a terminal
    /// state has outgoing transitions.
    pub fn build(self) -> Result<MachineDefinition<S, K>, FsmError> {
        let name = self.name;
        let invalid = |reason: String| FsmError::InvalidDefinition {
            machine: name,
            reason,
        };

        let initial = self
            .initial
            .ok_or_else(|| invalid("no initial state".to_string()))?;

        let states: HashSet<S> = self.states.iter().copied().collect();
        if !states.contains(&initial) {
            return Err(invalid(format!("initial state {initial:?} is not declared")));
        }
        if let Some(state) = self.terminal.iter().find(|s| !states.contains(s)) {
            return Err(invalid(format!("terminal state {state:?} is not declared")));
        }

        let events: HashSet<K> = self.events.iter().copied().collect();
        let terminal: HashSet<S> = self.terminal.iter().copied().collect();
        let mut table = HashMap::with_capacity(self.transitions.len());

        for Transition { from, on, to } in self.transitions {
            if !states.contains(&from) || !states.contains(&to) {
                return Err(invalid(format!(
                    "transition {from:?} --{on:?}--> {to:?} uses an undeclared state"
                )));
            }
            if !events.contains(&on) {
                return Err(invalid(format!("event {on:?} is not declared")));
            }
            if terminal.contains(&from) {
                return Err(invalid(format!(
                    "terminal state {from:?} has an outgoing transition on {on:?}"
                )));
            }
            if let Some(existing) = table.insert((from, on), to)
                && existing != to
            {
                return Err(invalid(format!(
                    "{from:?} on {on:?} maps to both {existing:?} and {to:?}"
                )));
            }
        }

        Ok(MachineDefinition {
            name,
            states: self.states,
            events,
            table,
            initial,
            terminal,
        })
    }
}

// =============================================================================
// Running Machine
// =============================================================================

/// Follow-up events queued by entry actions.
#[derive(Debug)]
pub struct Outbox<E> {
    queue: VecDeque<E>,
}

impl<E> Default for Outbox<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Outbox<E> {
    /// Empty outbox.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    /// Queue `event` to be fired after the current entry action returns.
    pub fn emit(&mut self, event: E) {
        self.queue.push_back(event);
    }

    /// Number of queued events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn pop(&mut self) -> Option<E> {
        self.queue.pop_front()
    }
}

/// Result of firing one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome<S> {
    /// A declared transition was taken.
    Moved {
        /// State before the event.
        from: S,
        /// State after the event.
        to: S,
    },
    /// No transition is declared for the pair; the state is unchanged.
    Ignored {
        /// Current (unchanged) state.
        state: S,
    },
}

/// A running instance of a [`MachineDefinition`].
#[derive(Debug)]
pub struct StateMachine<S: Label, E: Signal> {
    definition: Arc<MachineDefinition<S, E::Kind>>,
    current: S,
    started: bool,
}

impl<S: Label, E: Signal> StateMachine<S, E> {
    /// Create a machine positioned at the initial state, not yet started.
    #[must_use]
    pub fn new(definition: Arc<MachineDefinition<S, E::Kind>>) -> Self {
        let current = definition.initial();
        Self {
            definition,
            current,
            started: false,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> S {
        self.current
    }

    /// Whether `start` has run.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started
    }

    /// Whether the machine sits in a terminal state.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.started && self.definition.is_terminal(self.current)
    }

    /// Shared definition.
    #[must_use]
    pub fn definition(&self) -> &Arc<MachineDefinition<S, E::Kind>> {
        &self.definition
    }

    /// Enter the initial state and run its entry action, then drain any
    /// follow-up events.
    ///
    /// # Errors
    ///
    /// Returns [`FsmError::AlreadyStarted`] on a second call, or whatever the
    /// entry actions return.
    pub fn start<H>(&mut self, actions: &mut H) -> Result<S, H::Error>
    where
        H: EntryActions<S, E>,
    {
        if self.started {
            return Err(FsmError::AlreadyStarted {
                machine: self.definition.name(),
            }
            .into());
        }
        self.started = true;
        self.current = self.definition.initial();
        tracing::debug!(
            machine = self.definition.name(),
            state = ?self.current,
            "State machine started"
        );

        let mut outbox = Outbox::new();
        actions.on_entry(self.current, None, &mut outbox)?;
        self.drain(&mut outbox, actions)?;
        Ok(self.current)
    }

    /// Fire `event` and run to completion.
    ///
    /// The returned outcome describes `event` itself; chained follow-ups are
    /// visible through [`state`](Self::state).
    ///
    /// # Errors
    ///
    /// Returns [`FsmError::NotStarted`] before `start`,
    /// [`FsmError::InvalidEvent`] for an undeclared event kind, or whatever
    /// the entry actions return.
    pub fn fire<H>(&mut self, event: E, actions: &mut H) -> Result<FireOutcome<S>, H::Error>
    where
        H: EntryActions<S, E>,
    {
        if !self.started {
            return Err(FsmError::NotStarted {
                machine: self.definition.name(),
            }
            .into());
        }

        let mut outbox = Outbox::new();
        let outcome = self.dispatch(event, actions, &mut outbox)?;
        self.drain(&mut outbox, actions)?;
        Ok(outcome)
    }

    /// Return to the initial state, not started.
    pub fn reset(&mut self) {
        self.current = self.definition.initial();
        self.started = false;
    }

    fn drain<H>(&mut self, outbox: &mut Outbox<E>, actions: &mut H) -> Result<(), H::Error>
    where
        H: EntryActions<S, E>,
    {
        while let Some(next) = outbox.pop() {
            self.dispatch(next, actions, outbox)?;
        }
        Ok(())
    }

    fn dispatch<H>(
        &mut self,
        event: E,
        actions: &mut H,
        outbox: &mut Outbox<E>,
    ) -> Result<FireOutcome<S>, H::Error>
    where
        H: EntryActions<S, E>,
    {
        let kind = event.kind();
        let machine = self.definition.name();

        if !self.definition.declares_event(kind) {
            return Err(FsmError::InvalidEvent {
                machine,
                event: format!("{kind:?}"),
            }
            .into());
        }

        let Some(to) = self.definition.target(self.current, kind) else {
            tracing::warn!(
                machine,
                state = ?self.current,
                event = ?kind,
                "No transition declared, event ignored"
            );
            return Ok(FireOutcome::Ignored {
                state: self.current,
            });
        };

        let from = self.current;
        self.current = to;
        tracing::debug!(machine, ?from, ?to, event = ?kind, "Transition");

        actions.on_entry(to, Some(&event), outbox)?;
        Ok(FireOutcome::Moved { from, to })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Light {
        Off,
        On,
        Blinking,
        Broken,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Switch {
        Boot,
        Toggle,
        Blink,
        Smash,
        Unused,
    }

    #[derive(Debug)]
    enum SwitchEvent {
        Boot,
        Toggle,
        Blink { times: u32 },
        Smash,
        Unused,
    }

    impl Signal for SwitchEvent {
        type Kind = Switch;

        fn kind(&self) -> Switch {
            match self {
                Self::Boot => Switch::Boot,
                Self::Toggle => Switch::Toggle,
                Self::Blink { .. } => Switch::Blink,
                Self::Smash => Switch::Smash,
                Self::Unused => Switch::Unused,
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        entered: Vec<Light>,
        blink_budget: u32,
    }

    impl EntryActions<Light, SwitchEvent> for Recorder {
        type Error = FsmError;

        fn on_entry(
            &mut self,
            state: Light,
            trigger: Option<&SwitchEvent>,
            outbox: &mut Outbox<SwitchEvent>,
        ) -> Result<(), FsmError> {
            self.entered.push(state);
            match (state, trigger) {
                (Light::Off, None) => outbox.emit(SwitchEvent::Boot),
                (Light::Blinking, Some(SwitchEvent::Blink { times })) => {
                    self.blink_budget = *times;
                    outbox.emit(SwitchEvent::Toggle);
                }
                (Light::Blinking, _) => {
                    return Err(FsmError::entry_action("light", state, "blink needs a count"));
                }
                _ => {}
            }
            Ok(())
        }
    }

    fn definition() -> Arc<MachineDefinition<Light, Switch>> {
        Arc::new(
            MachineDefinition::builder("light")
                .states([Light::Off, Light::On, Light::Blinking, Light::Broken])
                .events([Switch::Boot, Switch::Toggle, Switch::Blink, Switch::Smash])
                .initial(Light::Off)
                .terminal(Light::Broken)
                .transition(Light::Off, Switch::Boot, Light::On)
                .transition(Light::On, Switch::Toggle, Light::Off)
                .transition(Light::Off, Switch::Toggle, Light::On)
                .transition(Light::On, Switch::Blink, Light::Blinking)
                .transition(Light::Blinking, Switch::Toggle, Light::Off)
                .transition(Light::On, Switch::Smash, Light::Broken)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn start_runs_initial_entry_and_chains() {
        let mut machine = StateMachine::<Light, SwitchEvent>::new(definition());
        let mut rec = Recorder::default();

        let state = machine.start(&mut rec).unwrap();

        assert_eq!(state, Light::On);
        assert_eq!(rec.entered, vec![Light::Off, Light::On]);
    }

    #[test]
    fn declared_transition_moves_and_runs_entry_once() {
        let def = definition();
        let pairs: Vec<_> = def.transitions().collect();

        for Transition { from, on, to } in pairs {
            let mut machine = StateMachine::<Light, SwitchEvent>::new(Arc::clone(&def));
            let mut rec = Recorder::default();
            machine.start(&mut rec).unwrap();
            machine.current = from;
            rec.entered.clear();

            let event = match on {
                Switch::Boot => SwitchEvent::Boot,
                Switch::Toggle => SwitchEvent::Toggle,
                Switch::Blink => SwitchEvent::Blink { times: 2 },
                Switch::Smash => SwitchEvent::Smash,
                Switch::Unused => SwitchEvent::Unused,
            };
            let outcome = machine.fire(event, &mut rec).unwrap();

            assert_eq!(outcome, FireOutcome::Moved { from, to });
            assert_eq!(rec.entered.iter().filter(|s| **s == to).count(), 1);
            assert_eq!(rec.entered.first(), Some(&to));
        }
    }

    #[test]
    fn undeclared_pair_is_ignored() {
        let mut machine = StateMachine::<Light, SwitchEvent>::new(definition());
        let mut rec = Recorder::default();
        machine.start(&mut rec).unwrap();
        assert_eq!(machine.state(), Light::On);
        rec.entered.clear();

        let outcome = machine.fire(SwitchEvent::Boot, &mut rec).unwrap();

        assert_eq!(outcome, FireOutcome::Ignored { state: Light::On });
        assert_eq!(machine.state(), Light::On);
        assert!(rec.entered.is_empty());
    }

    #[test]
    fn every_undeclared_pair_gets_the_same_policy() {
        let def = definition();
        let kinds = [Switch::Boot, Switch::Toggle, Switch::Blink, Switch::Smash];

        for &state in def.states() {
            for kind in kinds {
                if def.target(state, kind).is_some() {
                    continue;
                }
                let mut machine = StateMachine::<Light, SwitchEvent>::new(Arc::clone(&def));
                let mut rec = Recorder::default();
                machine.start(&mut rec).unwrap();
                machine.current = state;

                let event = match kind {
                    Switch::Boot => SwitchEvent::Boot,
                    Switch::Toggle => SwitchEvent::Toggle,
                    Switch::Blink => SwitchEvent::Blink { times: 1 },
                    _ => SwitchEvent::Smash,
                };
                let outcome = machine.fire(event, &mut rec).unwrap();
                assert_eq!(outcome, FireOutcome::Ignored { state });
                assert_eq!(machine.state(), state);
            }
        }
    }

    #[test]
    fn undeclared_event_kind_fails_fast() {
        let mut machine = StateMachine::<Light, SwitchEvent>::new(definition());
        let mut rec = Recorder::default();
        machine.start(&mut rec).unwrap();

        let err = machine.fire(SwitchEvent::Unused, &mut rec).unwrap_err();

        assert!(matches!(err, FsmError::InvalidEvent { .. }));
        assert_eq!(machine.state(), Light::On);
    }

    #[test]
    fn payload_reaches_entry_action_and_chains() {
        let mut machine = StateMachine::<Light, SwitchEvent>::new(definition());
        let mut rec = Recorder::default();
        machine.start(&mut rec).unwrap();

        let outcome = machine
            .fire(SwitchEvent::Blink { times: 3 }, &mut rec)
            .unwrap();

        assert_eq!(
            outcome,
            FireOutcome::Moved {
                from: Light::On,
                to: Light::Blinking
            }
        );
        assert_eq!(rec.blink_budget, 3);
        // Blinking emits Toggle, landing in Off.
        assert_eq!(machine.state(), Light::Off);
    }

    #[test]
    fn fire_before_start_fails() {
        let mut machine = StateMachine::<Light, SwitchEvent>::new(definition());
        let err = machine
            .fire(SwitchEvent::Toggle, &mut Recorder::default())
            .unwrap_err();
        assert!(matches!(err, FsmError::NotStarted { .. }));
    }

    #[test]
    fn double_start_fails_until_reset() {
        let mut machine = StateMachine::<Light, SwitchEvent>::new(definition());
        let mut rec = Recorder::default();
        machine.start(&mut rec).unwrap();

        assert!(matches!(
            machine.start(&mut rec),
            Err(FsmError::AlreadyStarted { .. })
        ));

        machine.reset();
        assert!(!machine.is_started());
        assert_eq!(machine.state(), Light::Off);
        assert_eq!(machine.start(&mut rec).unwrap(), Light::On);
    }

    #[test]
    fn terminal_state_reports_finished() {
        let mut machine = StateMachine::<Light, SwitchEvent>::new(definition());
        let mut rec = Recorder::default();
        machine.start(&mut rec).unwrap();
        assert!(!machine.is_finished());

        machine.fire(SwitchEvent::Smash, &mut rec).unwrap();

        assert!(machine.is_finished());
    }

    #[test]
    fn builder_rejects_conflicting_targets() {
        let err = MachineDefinition::<Light, Switch>::builder("bad")
            .states([Light::Off, Light::On, Light::Broken])
            .events([Switch::Toggle])
            .initial(Light::Off)
            .transition(Light::Off, Switch::Toggle, Light::On)
            .transition(Light::Off, Switch::Toggle, Light::Broken)
            .build()
            .unwrap_err();
        assert!(matches!(err, FsmError::InvalidDefinition { .. }));
    }

    #[test]
    fn builder_rejects_undeclared_event() {
        let err = MachineDefinition::<Light, Switch>::builder("bad")
            .states([Light::Off, Light::On])
            .events([Switch::Toggle])
            .initial(Light::Off)
            .transition(Light::Off, Switch::Boot, Light::On)
            .build()
            .unwrap_err();
        assert!(matches!(err, FsmError::InvalidDefinition { .. }));
    }

    #[test]
    fn builder_rejects_transition_out_of_terminal() {
        let err = MachineDefinition::<Light, Switch>::builder("bad")
            .states([Light::On, Light::Broken])
            .events([Switch::Toggle])
            .initial(Light::On)
            .terminal(Light::Broken)
            .transition(Light::Broken, Switch::Toggle, Light::On)
            .build()
            .unwrap_err();
        assert!(matches!(err, FsmError::InvalidDefinition { .. }));
    }

    #[test]
    fn builder_requires_declared_initial_state() {
        let missing = MachineDefinition::<Light, Switch>::builder("bad")
            .states([Light::On])
            .build()
            .unwrap_err();
        assert!(matches!(missing, FsmError::InvalidDefinition { .. }));

        let undeclared = MachineDefinition::<Light, Switch>::builder("bad")
            .states([Light::On])
            .initial(Light::Off)
            .build()
            .unwrap_err();
        assert!(matches!(undeclared, FsmError::InvalidDefinition { .. }));
    }

    #[test]
    fn entry_action_error_is_returned_after_the_move() {
        let def = Arc::new(
            MachineDefinition::builder("light")
                .states([Light::Off, Light::On, Light::Blinking])
                .events([Switch::Boot, Switch::Toggle])
                .initial(Light::Off)
                .transition(Light::Off, Switch::Boot, Light::On)
                .transition(Light::On, Switch::Toggle, Light::Blinking)
                .build()
                .unwrap(),
        );
        let mut machine = StateMachine::<Light, SwitchEvent>::new(def);
        let mut rec = Recorder::default();
        machine.start(&mut rec).unwrap();

        let err = machine.fire(SwitchEvent::Toggle, &mut rec).unwrap_err();

        assert!(matches!(err, FsmError::EntryAction { .. }));
        assert_eq!(machine.state(), Light::Blinking);
    }
}
