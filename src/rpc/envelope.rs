use thiserror::Error;

use crate::port::{MessagePort, PortMessage};
use crate::value::RpcValue;

const CALL: u8 = 0;
const RESOLVE: u8 = 1;
const REJECT: u8 = 2;
const ABORT: u8 = 3;
const GENERATOR_GENERATE: u8 = 4;

const GENERATOR_CAPABILITIES: [&str; 4] = ["next", "return", "throw", "asyncDispose"];

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope is not a tagged array")]
    NotTagged,
    #[error("unknown envelope tag {0}")]
    UnknownTag(f64),
    #[error("{0} envelope is missing its reply port")]
    MissingReplyPort(&'static str),
    #[error("generator envelope is missing the {0} port")]
    MissingGeneratorPort(&'static str),
}

/// The four capability ports of one generator invocation, as seen by the
/// side that serves them.
#[derive(Debug)]
pub struct GeneratorPorts {
    pub next: MessagePort,
    pub return_: MessagePort,
    pub throw: MessagePort,
    pub async_dispose: MessagePort,
}

/// Decoded wire envelope. `Call` and `GeneratorGenerate` travel on a shared
/// method port; the rest only ever travel on a per-call reply port.
#[derive(Debug)]
pub enum Envelope {
    Call {
        args: Vec<RpcValue>,
        reply: MessagePort,
    },
    GeneratorGenerate {
        ports: GeneratorPorts,
        args: Vec<RpcValue>,
    },
    Resolve(RpcValue),
    Reject(RpcValue),
    Abort,
}

impl Envelope {
    /// Split into the array payload and the transfer list.
    pub fn into_message(self) -> (RpcValue, Vec<MessagePort>) {
        match self {
            Self::Call { args, reply } => {
                let mut items = vec![tag(CALL)];
                items.extend(args);
                (RpcValue::Array(items), vec![reply])
            }
            Self::GeneratorGenerate { ports, args } => {
                let descriptor = RpcValue::object(
                    GENERATOR_CAPABILITIES
                        .iter()
                        .enumerate()
                        .map(|(index, name)| (*name, RpcValue::Number(index as f64))),
                );
                let mut items = vec![tag(GENERATOR_GENERATE), descriptor];
                items.extend(args);
                let transfer = vec![ports.next, ports.return_, ports.throw, ports.async_dispose];
                (RpcValue::Array(items), transfer)
            }
            Self::Resolve(value) => (RpcValue::Array(vec![tag(RESOLVE), value]), Vec::new()),
            Self::Reject(reason) => (RpcValue::Array(vec![tag(REJECT), reason]), Vec::new()),
            Self::Abort => (RpcValue::Array(vec![tag(ABORT)]), Vec::new()),
        }
    }

    pub fn from_message(message: PortMessage) -> Result<Self, EnvelopeError> {
        let PortMessage { data, ports } = message;
        let RpcValue::Array(items) = data else {
            return Err(EnvelopeError::NotTagged);
        };
        let mut items = items.into_iter();
        let raw_tag = items
            .next()
            .and_then(|value| value.as_f64())
            .ok_or(EnvelopeError::NotTagged)?;

        if raw_tag.fract() != 0.0 || !(0.0..=255.0).contains(&raw_tag) {
            return Err(EnvelopeError::UnknownTag(raw_tag));
        }

        match raw_tag as u8 {
            CALL => {
                let reply = ports
                    .into_iter()
                    .next()
                    .ok_or(EnvelopeError::MissingReplyPort("CALL"))?;
                Ok(Self::Call {
                    args: items.collect(),
                    reply,
                })
            }
            RESOLVE => Ok(Self::Resolve(items.next().unwrap_or_default())),
            REJECT => Ok(Self::Reject(items.next().unwrap_or_default())),
            ABORT => Ok(Self::Abort),
            GENERATOR_GENERATE => {
                let descriptor = items.next().unwrap_or_default();
                let mut slots: Vec<Option<MessagePort>> = ports.into_iter().map(Some).collect();
                let mut take = |name: &'static str| -> Result<MessagePort, EnvelopeError> {
                    descriptor
                        .get(name)
                        .and_then(RpcValue::as_f64)
                        .and_then(|index| slots.get_mut(index as usize))
                        .and_then(Option::take)
                        .ok_or(EnvelopeError::MissingGeneratorPort(name))
                };
                let ports = GeneratorPorts {
                    next: take("next")?,
                    return_: take("return")?,
                    throw: take("throw")?,
                    async_dispose: take("asyncDispose")?,
                };
                Ok(Self::GeneratorGenerate {
                    ports,
                    args: items.collect(),
                })
            }
            _ => Err(EnvelopeError::UnknownTag(raw_tag)),
        }
    }
}

fn tag(value: u8) -> RpcValue {
    RpcValue::Number(value as f64)
}
