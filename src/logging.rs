//! Helper macros enforcing consistent channel log fields.
//!
//! These macros keep `channel` (and optionally `destination`) fields present on
//! every log emitted from dispatcher/worker layers so downstream parsing can
//! rely on them.

/// Log an event for a channel/destination pair plus any extra fields.
#[macro_export]
macro_rules! courier_event {
    ($level:ident, $target:expr, $event:expr, channel = $channel:expr, destination = $destination:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target = $target,
            event = $event,
            channel = $channel,
            destination = $destination,
            $($field = %$value,)*
        )
    };
    ($level:ident, $target:expr, $event:expr, channel = $channel:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target = $target,
            event = $event,
            channel = $channel,
            $($field = %$value,)*
        )
    };
}
