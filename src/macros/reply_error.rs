// Unwraps an `FsResult` inside a fuser callback, or answers the request with the
// errno of the error and returns.
//
// call:
// let entry = reply_try!(self.lookup_child(parent, name), reply, "lookup {}", parent);
// result:
// let entry = match self.lookup_child(parent, name) {
//     Ok(value) => value,
//     Err(e) => {
//         warn!("lookup {}: {}", parent, e);
//         reply.error(e.errno());
//         return;
//     }
// };

#[macro_export]
macro_rules! reply_try {
    ($result:expr, $reply:ident, $($arg:tt)+) => {
        match $result {
            Ok(value) => value,
            Err(e) => {
                let e: $crate::error::FsError = e;
                if matches!(e, $crate::error::FsError::NotFound(_)) {
                    tracing::debug!("{}: {}", format!($($arg)+), e);
                } else {
                    tracing::warn!("{}: {}", format!($($arg)+), e);
                }
                $reply.error(e.errno());
                return;
            }
        }
    };
}
