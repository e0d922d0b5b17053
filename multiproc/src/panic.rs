//! Turning `catch_unwind` payloads into something printable.

use std::any::Any;

/// The message a panic was raised with, if it carried a string.
pub fn panic_message(payload: &(dyn Any + Send)) -> Option<&str> {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
}

/// Prefixes the panic message with `context`. Used for failed tests and for children that
/// panicked.
pub fn panic_to_string(context: &str, payload: Box<dyn Any + Send>) -> String {
    match panic_message(&*payload) {
        Some(msg) => format!("{}: {}", context, msg),
        None => format!("{} (no message)", context),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, panic_any};

    #[test]
    fn extracts_message() {
        let payload = catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(&*payload), Some("boom 1"));
        assert_eq!(panic_to_string("worker", payload), "worker: boom 1");

        let payload = catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_to_string("worker", payload), "worker: static");

        let payload = catch_unwind(|| panic_any(7u8)).unwrap_err();
        assert_eq!(panic_message(&*payload), None);
        assert_eq!(panic_to_string("worker", payload), "worker (no message)");
    }
}
