//! Saved terminal state
//!
//! The passphrase prompt flips the controlling terminal into no-echo mode.
//! The attributes captured here are restored by the shutdown signal handler,
//! so an interrupt arriving mid-prompt does not leave the terminal silent.

use std::io;
use std::sync::Mutex;

use nix::sys::termios::{tcgetattr, tcsetattr, SetArg, Termios};

static SAVED_STATE: Mutex<Option<Termios>> = Mutex::new(None);

/// Capture the current terminal attributes of stdin.
///
/// A no-op when stdin is not a terminal.
pub fn save() {
    if let Ok(state) = tcgetattr(io::stdin()) {
        if let Ok(mut saved) = SAVED_STATE.lock() {
            *saved = Some(state);
        }
    }
}

/// Drop the saved attributes without touching the terminal.
///
/// Called once the prompt has completed normally and restored echo itself.
pub fn clear() {
    if let Ok(mut saved) = SAVED_STATE.lock() {
        *saved = None;
    }
}

/// Re-apply the saved attributes, if any.
///
/// Safe to call from any task on any exit path; does nothing when no prompt
/// is in flight.
pub fn restore_if_saved() {
    if let Ok(mut saved) = SAVED_STATE.lock() {
        if let Some(state) = saved.take() {
            let _ = tcsetattr(io::stdin(), SetArg::TCSANOW, &state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_without_save_is_a_noop() {
        clear();
        restore_if_saved();
    }
}
