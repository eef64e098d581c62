//! Thread identification for diagnostics.

/// Human-readable label of the calling thread: its name when set, else its id.
pub fn thread_label() -> String {
    let current = std::thread::current();
    current.name().map_or_else(
        || format!("{:?}", current.id()),
        |name| format!("{name} ({:?})", current.id()),
    )
}
