//! Method names exchanged during the handshake.

use std::fmt;
use std::str::FromStr;

/// Capabilities the host exposes to sandboxed code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HostMethod {
    LogTelemetry,
    NotifyError,
    NotifySecurityPolicyViolation,
    NotifyIntrinsicHeight,
    NotifyBackgroundColor,
    NotifyEscapeKey,
    NotifyNavigation,
    OpenExternal,
    ResolveDownloadUrl,
    SetWidgetState,
    RequestDisplayMode,
    CallCompletion,
    StreamCompletion,
    SendFollowUpMessage,
}

/// Controls the host drives inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SandboxMethod {
    RunWidgetCode,
    SetWidgetProps,
    SetTheme,
    SetSafeArea,
    Navigate,
    Stop,
    GetCurrentPath,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown method {0:?}")]
pub struct UnknownMethod(pub String);

impl HostMethod {
    pub const ALL: [HostMethod; 14] = [
        HostMethod::LogTelemetry,
        HostMethod::NotifyError,
        HostMethod::NotifySecurityPolicyViolation,
        HostMethod::NotifyIntrinsicHeight,
        HostMethod::NotifyBackgroundColor,
        HostMethod::NotifyEscapeKey,
        HostMethod::NotifyNavigation,
        HostMethod::OpenExternal,
        HostMethod::ResolveDownloadUrl,
        HostMethod::SetWidgetState,
        HostMethod::RequestDisplayMode,
        HostMethod::CallCompletion,
        HostMethod::StreamCompletion,
        HostMethod::SendFollowUpMessage,
    ];

    pub fn name(self) -> &'static str {
        match self {
            HostMethod::LogTelemetry => "logTelemetry",
            HostMethod::NotifyError => "notifyError",
            HostMethod::NotifySecurityPolicyViolation => "notifySecurityPolicyViolation",
            HostMethod::NotifyIntrinsicHeight => "notifyIntrinsicHeight",
            HostMethod::NotifyBackgroundColor => "notifyBackgroundColor",
            HostMethod::NotifyEscapeKey => "notifyEscapeKey",
            HostMethod::NotifyNavigation => "notifyNavigation",
            HostMethod::OpenExternal => "openExternal",
            HostMethod::ResolveDownloadUrl => "resolveDownloadUrl",
            HostMethod::SetWidgetState => "setWidgetState",
            HostMethod::RequestDisplayMode => "requestDisplayMode",
            HostMethod::CallCompletion => "callCompletion",
            HostMethod::StreamCompletion => "streamCompletion",
            HostMethod::SendFollowUpMessage => "sendFollowUpMessage",
        }
    }

    /// Methods whose calls stream values back.
    pub fn is_generator(self) -> bool {
        matches!(self, HostMethod::StreamCompletion)
    }

    /// Methods that only run while the user is actively interacting.
    pub fn requires_user_gesture(self) -> bool {
        matches!(
            self,
            HostMethod::RequestDisplayMode
                | HostMethod::CallCompletion
                | HostMethod::StreamCompletion
                | HostMethod::SendFollowUpMessage
                | HostMethod::OpenExternal
        )
    }
}

impl SandboxMethod {
    pub const ALL: [SandboxMethod; 7] = [
        SandboxMethod::RunWidgetCode,
        SandboxMethod::SetWidgetProps,
        SandboxMethod::SetTheme,
        SandboxMethod::SetSafeArea,
        SandboxMethod::Navigate,
        SandboxMethod::Stop,
        SandboxMethod::GetCurrentPath,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SandboxMethod::RunWidgetCode => "runWidgetCode",
            SandboxMethod::SetWidgetProps => "setWidgetProps",
            SandboxMethod::SetTheme => "setTheme",
            SandboxMethod::SetSafeArea => "setSafeArea",
            SandboxMethod::Navigate => "navigate",
            SandboxMethod::Stop => "stop",
            SandboxMethod::GetCurrentPath => "getCurrentPath",
        }
    }

    pub fn is_generator(self) -> bool {
        matches!(self, SandboxMethod::RunWidgetCode)
    }
}

impl fmt::Display for HostMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for SandboxMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HostMethod {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HostMethod::ALL
            .into_iter()
            .find(|method| method.name() == s)
            .ok_or_else(|| UnknownMethod(s.to_string()))
    }
}

impl FromStr for SandboxMethod {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SandboxMethod::ALL
            .into_iter()
            .find(|method| method.name() == s)
            .ok_or_else(|| UnknownMethod(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for method in HostMethod::ALL {
            assert_eq!(method.name().parse::<HostMethod>().unwrap(), method);
        }
        for method in SandboxMethod::ALL {
            assert_eq!(method.name().parse::<SandboxMethod>().unwrap(), method);
        }
        assert!("eval".parse::<SandboxMethod>().is_err());
    }

    #[test]
    fn gesture_set_is_fixed() {
        let gated: Vec<_> = HostMethod::ALL
            .into_iter()
            .filter(|method| method.requires_user_gesture())
            .map(HostMethod::name)
            .collect();
        assert_eq!(
            gated,
            [
                "openExternal",
                "requestDisplayMode",
                "callCompletion",
                "streamCompletion",
                "sendFollowUpMessage"
            ]
        );
    }
}
