use crate::error::Error;
use crate::native::MethodHandle;

/// RPC shape of a method. Only [`CallType::Normal`] (unary) is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallType {
    Normal,
    ClientStreaming,
    ServerStreaming,
    BiDiStreaming,
}

/// A method name bound once to a channel or server registration handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredMethod {
    name: String,
    call_type: CallType,
    handle: MethodHandle,
}

impl RegisteredMethod {
    /// Fails with [`Error::UnsupportedCallType`] for streaming call types.
    pub fn new(
        name: impl Into<String>,
        call_type: CallType,
        handle: MethodHandle,
    ) -> Result<Self, Error> {
        if call_type != CallType::Normal {
            return Err(Error::UnsupportedCallType(call_type));
        }
        Ok(Self {
            name: name.into(),
            call_type,
            handle,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    pub fn handle(&self) -> MethodHandle {
        self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_is_rejected() {
        let handle = MethodHandle::from_raw(1);
        let err =
            RegisteredMethod::new("/svc/stream", CallType::BiDiStreaming, handle).unwrap_err();
        assert!(matches!(err, Error::UnsupportedCallType(CallType::BiDiStreaming)));
    }

    #[test]
    fn unary_keeps_handle() {
        let m =
            RegisteredMethod::new("/svc/foo", CallType::Normal, MethodHandle::from_raw(9)).unwrap();
        assert_eq!(m.name(), "/svc/foo");
        assert_eq!(m.handle().raw(), 9);
        assert_eq!(m.call_type(), CallType::Normal);
    }
}
