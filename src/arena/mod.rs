// Arena-based storage for watcher metadata
//
// Each tree owns one watcher arena through its Root. Scopes keep only ordered
// lists of WatcherIds (their registries); everything the digest needs to
// evaluate, compare and react lives in the arena.

pub mod watcher_arena;

pub(crate) use watcher_arena::{Observation, WatcherArena, WatcherId, WatcherMetadata};
