//! Turns the configured mix into a stream of concrete operations.
//!
//! Selection is two weighted draws (keyspace, then command) followed by the
//! lifecycle policy for create and delete: a create only goes out for a
//! structure that does not exist and while the existing-count is below the
//! high watermark, a delete only for one that exists and while the count is
//! above the low watermark. Suppressed draws are reported as skipped.

use std::sync::Arc;

use rand::Rng;

use crate::{
    codec::Response,
    config::{Action, Command, Config, Keyspace, ValueSpec},
    keyspace::select_key,
};

mod state;
mod value;

pub use self::{
    state::{InvariantViolation, StructureState, Transition},
    value::{decode_integer, fill_values},
};

/// Shared, read-mostly workload description plus the lifecycle state of
/// every tracked keyspace.
#[derive(Debug)]
pub struct Workload {
    config: Arc<Config>,
    states: Vec<Option<StructureState>>,
}

#[derive(Debug)]
pub enum Selection<'a> {
    Dispatch(Operation<'a>),
    Skipped { keyspace: usize, action: Action },
}

#[derive(Debug, Clone, Copy)]
pub struct Operation<'a> {
    pub keyspace: &'a Keyspace,
    pub command: &'a Command,
    pub key_index: u64,
    /// Whether the structure existed when the operation was selected,
    /// `None` for keyspaces without create/delete commands.
    pub existed: Option<bool>,
    pub value: Option<&'a ValueSpec>,
}

impl Operation<'_> {
    pub fn action(&self) -> Action {
        self.command.action
    }

    /// A rejection for this operation is the expected answer of the server.
    pub fn expects_miss(&self) -> bool {
        self.existed == Some(false) && self.action() != Action::Create
    }
}

impl Workload {
    pub fn new(config: Arc<Config>) -> Self {
        let states = config
            .keyspaces()
            .items()
            .iter()
            .map(|keyspace| {
                keyspace
                    .tracks_lifecycle()
                    .then(|| StructureState::new(keyspace.count, keyspace.watermarks))
            })
            .collect();

        Self { config, states }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self, keyspace: usize) -> Option<&StructureState> {
        self.states.get(keyspace).and_then(Option::as_ref)
    }

    /// Existing-count per keyspace, `None` where untracked.
    pub fn existing(&self) -> Vec<Option<u64>> {
        self.states
            .iter()
            .map(|state| state.as_ref().map(StructureState::existing))
            .collect()
    }

    pub fn select<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
    ) -> Result<Selection<'_>, InvariantViolation> {
        let keyspace = self.config.keyspaces().sample(rng);
        let command = keyspace.commands.sample(rng);
        let state = self.state(keyspace.ordinal);

        let skipped = Selection::Skipped {
            keyspace: keyspace.ordinal,
            action: command.action,
        };

        let (key_index, existed) = match (command.action, state) {
            (Action::Create, Some(state)) => match state.try_create(select_key(keyspace, rng))? {
                Transition::Claimed(index) => (index, Some(false)),
                Transition::Suppressed | Transition::NoCandidate => return Ok(skipped),
            },
            (Action::Delete, Some(state)) => match state.try_delete(rng)? {
                Transition::Claimed(index) => (index, Some(true)),
                Transition::Suppressed | Transition::NoCandidate => return Ok(skipped),
            },
            (_, state) => {
                let index = select_key(keyspace, rng);
                (index, state.map(|state| state.exists(index)))
            }
        };

        let value = if command.action.needs_value() && command.action != Action::Create {
            keyspace.values.as_ref().map(|values| values.sample(rng))
        } else {
            None
        };

        Ok(Selection::Dispatch(Operation {
            keyspace,
            command,
            key_index,
            existed,
            value,
        }))
    }

    /// Applies a successful response to the tracked population.
    pub fn complete(&self, operation: &Operation<'_>, response: &Response) {
        if *response != Response::Success {
            return;
        }
        let Some(state) = self.state(operation.keyspace.ordinal) else {
            return;
        };
        let items = operation.command.items;
        match operation.action() {
            Action::Insert => state.grow(operation.key_index, items),
            Action::Remove => state.shrink(operation.key_index, items),
            Action::Truncate => state.truncate(operation.key_index, items),
            _ => (),
        }
    }
}
