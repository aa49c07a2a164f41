//! The data model: a resolved [`Task`] bound to a single host, addressed by
//! dense integer [`Rank`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Input/output record format understood by the worker binary.
///
/// `input_format` is absent for reduce tasks; `output_format` is absent for
/// map tasks in two-phase jobs (see [`Task`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Format {
    Text,
    Recordio,
}

impl Format {
    pub fn parse(s: &str) -> Option<Format> {
        match s {
            "text" => Some(Format::Text),
            "recordio" => Some(Format::Recordio),
            _ => None,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Text => write!(f, "text"),
            Format::Recordio => write!(f, "recordio"),
        }
    }
}

/// A dense rank in `[0, num_map + num_reduce)`. Ranks `[0, num_map)` are
/// mappers, the rest are reducers.
pub type Rank = usize;

/// A fully-resolved unit of work bound to a single host.
///
/// Invariant: `tmp_dir` and `log_filebase` must match the host's entries in
/// the global per-host maps (enforced by [`crate::spec_parser::parse_task_spec`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    /// Resolved IPv4 address of the host this task runs on.
    pub host: String,
    /// Opaque worker-class name passed through to the worker binary.
    pub user_class: String,
    pub input_format: Option<Format>,
    pub input_path: String,
    pub output_format: Option<Format>,
    pub output_path: String,
    pub tmp_dir: String,
    pub log_filebase: String,
}

/// The kind of role a rank plays, derived from its position relative to
/// `num_map`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Mapper,
    MapOnlyMapper,
    Reducer,
}

/// The normalized, ordered result of parsing a task spec: mappers first, then
/// reducers (empty in map-only mode).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskList {
    pub tasks: Vec<Task>,
    pub num_map_worker: usize,
    pub num_reduce_worker: usize,
    pub map_only: bool,
}

impl TaskList {
    pub fn num_worker(&self) -> usize {
        self.tasks.len()
    }

    pub fn role(&self, rank: Rank) -> Role {
        if self.map_only {
            Role::MapOnlyMapper
        } else if rank < self.num_map_worker {
            Role::Mapper
        } else {
            Role::Reducer
        }
    }

    pub fn is_mapper(&self, rank: Rank) -> bool {
        matches!(self.role(rank), Role::Mapper | Role::MapOnlyMapper)
    }

    pub fn is_reducer(&self, rank: Rank) -> bool {
        matches!(self.role(rank), Role::Reducer)
    }

    /// Local index of a rank within its own kind (0-based mapper id, or
    /// 0-based reducer id).
    pub fn local_rank(&self, rank: Rank) -> usize {
        if self.is_reducer(rank) {
            rank - self.num_map_worker
        } else {
            rank
        }
    }

    pub fn task(&self, rank: Rank) -> &Task {
        &self.tasks[rank]
    }

    pub fn mapper_ranks(&self) -> impl Iterator<Item = Rank> {
        0..self.num_map_worker
    }

    pub fn reducer_ranks(&self) -> std::ops::Range<Rank> {
        self.num_map_worker..self.tasks.len()
    }
}
