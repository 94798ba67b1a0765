//! Shared subprocess setup.

use tokio::process::Command;

/// Keep console windows from flashing up for background children on Windows.
#[cfg(windows)]
pub(crate) fn hide_window(cmd: &mut Command) {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
pub(crate) fn hide_window(_cmd: &mut Command) {}
