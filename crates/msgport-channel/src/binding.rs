//! Dynamic entry points for embedding runtimes.
//!
//! A runtime that dispatches port methods by name with loosely typed
//! arguments goes through [`invoke`] rather than the typed API.

use std::fmt;
use std::str::FromStr;

use crate::error::{PortError, Result};
use crate::port::MessagePort;
use crate::value::Value;

/// Methods reachable through [`invoke`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMethod {
    PostMessage,
    Start,
    Stop,
    Close,
    Drain,
    Ref,
    Unref,
    HasRef,
}

impl PortMethod {
    /// Entry point name as seen by the runtime, e.g. `postMessage`.
    pub fn as_str(self) -> &'static str {
        match self {
            PortMethod::PostMessage => "postMessage",
            PortMethod::Start => "start",
            PortMethod::Stop => "stop",
            PortMethod::Close => "close",
            PortMethod::Drain => "drain",
            PortMethod::Ref => "ref",
            PortMethod::Unref => "unref",
            PortMethod::HasRef => "hasRef",
        }
    }
}

impl fmt::Display for PortMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PortMethod {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "postMessage" => Ok(PortMethod::PostMessage),
            "start" => Ok(PortMethod::Start),
            "stop" => Ok(PortMethod::Stop),
            "close" => Ok(PortMethod::Close),
            "drain" => Ok(PortMethod::Drain),
            "ref" => Ok(PortMethod::Ref),
            "unref" => Ok(PortMethod::Unref),
            "hasRef" => Ok(PortMethod::HasRef),
            other => Err(PortError::UnknownMethod(other.to_string())),
        }
    }
}

/// Extract the transfer list from `postMessage`'s second argument.
///
/// Accepts an array or an options object with a `transfer` array. Anything
/// else means "no transfer list".
fn transfer_list(arg: Option<&Value>) -> Vec<Value> {
    match arg {
        Some(Value::Array(list)) => list.to_vec(),
        Some(Value::Object(options)) => match options.get("transfer") {
            Some(Value::Array(list)) => list.to_vec(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Call `method` on `port` with runtime-supplied arguments.
pub fn invoke(port: &MessagePort, method: PortMethod, args: &[Value]) -> Result<Value> {
    match method {
        PortMethod::PostMessage => {
            let value = args
                .first()
                .ok_or(PortError::MissingArguments("postMessage requires a message"))?;
            port.post_message(value, &transfer_list(args.get(1)))?;
        }
        PortMethod::Start => port.start()?,
        PortMethod::Stop => port.stop()?,
        PortMethod::Close => port.close(),
        PortMethod::Drain => port.drain()?,
        PortMethod::Ref => port.ref_handle(),
        PortMethod::Unref => port.unref_handle(),
        PortMethod::HasRef => return Ok(Value::Bool(port.has_ref())),
    }
    Ok(Value::Undefined)
}

#[cfg(test)]
mod tests {
    use msgport_loop::EventLoop;

    use super::*;
    use crate::buffer::ArrayBuffer;
    use crate::channel::create_channel;
    use crate::context::Context;

    #[test]
    fn method_names_parse() {
        for method in [
            PortMethod::PostMessage,
            PortMethod::Start,
            PortMethod::Stop,
            PortMethod::Close,
            PortMethod::Drain,
            PortMethod::Ref,
            PortMethod::Unref,
            PortMethod::HasRef,
        ] {
            assert_eq!(method.as_str().parse::<PortMethod>().unwrap(), method);
        }
        assert!(matches!(
            "postmessage".parse::<PortMethod>(),
            Err(PortError::UnknownMethod(_))
        ));
    }

    #[test]
    fn post_message_without_arguments_fails() {
        let event_loop = EventLoop::new();
        let context = Context::new(&event_loop);
        let (a, _b) = create_channel(&context).unwrap();

        let err = invoke(&a, PortMethod::PostMessage, &[]).unwrap_err();
        assert!(matches!(err, PortError::MissingArguments(_)));
    }

    #[test]
    fn non_array_transfer_argument_is_ignored() {
        let event_loop = EventLoop::new();
        let context = Context::new(&event_loop);
        let (a, b) = create_channel(&context).unwrap();
        let buf = ArrayBuffer::from_vec(vec![1, 2]);

        invoke(
            &a,
            PortMethod::PostMessage,
            &[Value::ArrayBuffer(buf.clone()), Value::from("not a list")],
        )
        .unwrap();
        assert!(!buf.is_detached(), "buffer should have been copied");
        assert_eq!(b.queued_messages(), 1);
    }

    #[test]
    fn transfer_option_object_is_honoured() {
        let event_loop = EventLoop::new();
        let context = Context::new(&event_loop);
        let (a, _b) = create_channel(&context).unwrap();
        let buf = ArrayBuffer::from_vec(vec![1, 2]);
        let options = Value::object([(
            "transfer",
            Value::array([Value::ArrayBuffer(buf.clone())]),
        )]);

        invoke(
            &a,
            PortMethod::PostMessage,
            &[Value::ArrayBuffer(buf.clone()), options],
        )
        .unwrap();
        assert!(buf.is_detached());
    }

    #[test]
    fn ref_state_round_trips() {
        let event_loop = EventLoop::new();
        let context = Context::new(&event_loop);
        let (a, _b) = create_channel(&context).unwrap();

        invoke(&a, PortMethod::Unref, &[]).unwrap();
        assert_eq!(
            invoke(&a, PortMethod::HasRef, &[]).unwrap(),
            Value::Bool(false)
        );
        invoke(&a, PortMethod::Ref, &[]).unwrap();
        assert_eq!(
            invoke(&a, PortMethod::HasRef, &[]).unwrap(),
            Value::Bool(true)
        );

        invoke(&a, PortMethod::Close, &[]).unwrap();
        assert_eq!(
            invoke(&a, PortMethod::HasRef, &[]).unwrap(),
            Value::Bool(false)
        );
        assert!(matches!(
            invoke(&a, PortMethod::Start, &[]),
            Err(PortError::PortClosed)
        ));
    }
}
