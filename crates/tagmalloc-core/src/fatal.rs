//! Fatal-error reporting for heap corruption.
//!
//! Every integrity-check failure funnels through [`malloc_printerr`]: a
//! single-line diagnostic on stderr, then immediate process termination.
//! Corruption is never recovered and no cleanup runs.
//!
//! The reporter itself is replaceable so that harnesses and tests can
//! observe the diagnostic tag instead of dying. An installed handler is
//! expected to diverge (panic or exit); if it returns, the process still
//! aborts.

use parking_lot::RwLock;

/// A replacement corruption reporter. Receives the diagnostic tag.
pub type FatalHandler = fn(&'static str);

static HANDLER: RwLock<Option<FatalHandler>> = RwLock::new(None);

/// Installs a process-wide corruption reporter, returning the previous one.
pub fn set_fatal_handler(handler: Option<FatalHandler>) -> Option<FatalHandler> {
    let mut slot = HANDLER.write();
    std::mem::replace(&mut slot, handler)
}

/// Reports a fatal heap-corruption diagnostic and terminates.
///
/// The tag strings are stable identifiers; external tooling matches on
/// them verbatim.
pub fn malloc_printerr(tag: &'static str) -> ! {
    let handler = *HANDLER.read();
    if let Some(h) = handler {
        h(tag);
    }
    eprintln!("{tag}");
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn panicking_handler(tag: &'static str) {
        panic!("fatal malloc error: {tag}");
    }

    #[test]
    fn handler_is_invoked_before_abort() {
        set_fatal_handler(Some(panicking_handler));
        let result = std::panic::catch_unwind(|| malloc_printerr("free(): invalid size"));
        let err = result.expect_err("handler must divert the abort");
        let msg = err
            .downcast_ref::<String>()
            .cloned()
            .unwrap_or_default();
        assert!(msg.contains("free(): invalid size"));
    }
}
