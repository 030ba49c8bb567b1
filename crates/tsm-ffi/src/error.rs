//! Per-thread record of the most recent failed call.

use std::cell::RefCell;
use std::ffi::CString;

use crate::types::TsmStatus;

struct LastError {
    status: TsmStatus,
    message: CString,
}

thread_local! {
    static LAST_ERROR: RefCell<Option<LastError>> = const { RefCell::new(None) };
}

/// Record a failure on this thread and hand its status back.
///
/// Interior NUL bytes are dropped so the message always survives the trip
/// into a C string.
pub(crate) fn record(status: TsmStatus, message: impl Into<String>) -> TsmStatus {
    let mut message = message.into();
    message.retain(|ch| ch != '\0');
    let message = CString::new(message).unwrap_or_default();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(LastError { status, message }));
    status
}

/// Status of the recorded failure, `Ok` when there is none.
pub(crate) fn last_status() -> TsmStatus {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .map_or(TsmStatus::Ok, |last| last.status)
    })
}

/// Take the recorded message, clearing the record.
pub(crate) fn take_message() -> Option<CString> {
    LAST_ERROR.with(|slot| slot.borrow_mut().take().map(|last| last.message))
}
