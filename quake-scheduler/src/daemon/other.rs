//! Detachment is unavailable off Unix; foreground runs still get the PID
//! file and signal handling.

use std::path::Path;

use crate::{Error, Result};

pub(crate) fn detach() -> Result<()> {
    Err(Error::config("daemon mode is only supported on Unix"))
}

pub(crate) fn redirect_streams(_log_file: Option<&Path>) -> Result<()> {
    Err(Error::config("daemon mode is only supported on Unix"))
}
