//! Hard caps on untrusted input. Requests exceeding any of these fail with
//! `LimitExceeded` before touching the store.

/// Machines in the inventory.
pub const MAX_MACHINES: usize = 256;

/// Machine display name, in bytes.
pub const MAX_NAME_LEN: usize = 128;

/// Requester id, in bytes.
pub const MAX_REQUESTER_ID_LEN: usize = 256;

/// Reservations kept per machine (history included).
pub const MAX_RESERVATIONS_PER_MACHINE: usize = 200_000;

/// One wire-protocol line, in bytes.
pub const MAX_LINE_LEN: usize = 16 * 1024;

/// Capacity of the WAL writer's command channel.
pub const WAL_CHANNEL_CAPACITY: usize = 4096;
