use bitflags::bitflags;

bitflags! {
    /// Which aspects of a table's sync state to reset. Flags combine
    /// freely; `Watcher::resync_table` applies whichever combination is set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResyncMode: u8 {
        /// Mark every shadow row changed, so the next upload pass re-sends
        /// the whole table.
        const UPLOAD = 1 << 0;
        /// Clear `last_sync`, so the next download pass re-requests
        /// everything the server has for this table.
        const DOWNLOAD = 1 << 1;
        /// Inflate any user row missing a shadow row.
        const CHECK_LOCAL_DATA = 1 << 2;
        /// Delete and re-inflate every shadow row from current table state.
        const CLEAN_LOCAL_DATA = 1 << 3;
        /// Delete both the shadow rows and the user rows outright.
        const CLEAR_LOCAL_DATA = 1 << 4;
        /// Ask the server to drop its copy of this table (best-effort,
        /// propagated by the caller as a `remove-table` request).
        const CLEAR_SERVER_DATA = 1 << 5;
    }
}
