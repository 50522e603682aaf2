//! Signal names and numbers.

use nix::sys::signal::Signal;
use pipewright_types::{Error, Result};

/// Parse a signal from a number or a name, with or without `SIG`.
///
/// ```
/// use pipewright_kernel::scheduler::parse_signal;
///
/// assert_eq!(parse_signal("TERM").unwrap(), 15);
/// assert_eq!(parse_signal("SIGKILL").unwrap(), 9);
/// assert_eq!(parse_signal("2").unwrap(), 2);
/// ```
pub fn parse_signal(name: &str) -> Result<i32> {
    if let Ok(num) = name.parse::<i32>() {
        return to_signal(num).map(|s| s.map_or(0, |sig| sig as i32));
    }

    let upper = name.to_ascii_uppercase();
    let bare = upper.strip_prefix("SIG").unwrap_or(&upper);

    let signal = match bare {
        "TERM" => Signal::SIGTERM,
        "KILL" => Signal::SIGKILL,
        "STOP" => Signal::SIGSTOP,
        "CONT" => Signal::SIGCONT,
        "INT" => Signal::SIGINT,
        "HUP" => Signal::SIGHUP,
        "USR1" => Signal::SIGUSR1,
        "USR2" => Signal::SIGUSR2,
        "QUIT" => Signal::SIGQUIT,
        "PIPE" => Signal::SIGPIPE,
        "ALRM" => Signal::SIGALRM,
        "TSTP" => Signal::SIGTSTP,
        _ => return Err(Error::InvalidSignal(name.to_string())),
    };
    Ok(signal as i32)
}

/// Check a signal number. 0 is accepted and probes for existence.
pub(crate) fn to_signal(num: i32) -> Result<Option<Signal>> {
    if num == 0 {
        return Ok(None);
    }
    Signal::try_from(num)
        .map(Some)
        .map_err(|_| Error::InvalidSignal(num.to_string()))
}
