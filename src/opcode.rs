//! RPC opcodes.
//!
//! Identifiers are protocol-stable: new opcodes may be appended, existing
//! values never change.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum Opcode {
    Handshake = 1,
    CreateInstance = 2,
    CreateSession = 3,
    DestroySession = 4,
    BeginSession = 5,
    EndSession = 6,
    RequestExitSession = 7,
    EnumerateSwapchainFormats = 8,
    CreateSwapchain = 9,
    DestroySwapchain = 10,
    EnumerateSwapchainImages = 11,
    AcquireSwapchainImage = 12,
    WaitSwapchainImage = 13,
    ReleaseSwapchainImage = 14,
    CreateReferenceSpace = 15,
    CreateActionSpace = 16,
    LocateSpace = 17,
    DestroySpace = 18,
    EnumerateViewConfigurations = 19,
    EnumerateViewConfigurationViews = 20,
    GetViewConfigurationProperties = 21,
    GetSystemProperties = 22,
    GetInstanceProperties = 23,
    PollEvent = 24,
    WaitFrame = 25,
    BeginFrame = 26,
    EndFrame = 27,
    SyncActionsAndGetState = 28,
    StopHaptic = 29,
    ApplyHaptic = 30,
    LocateViews = 31,
    GetInputSourceLocalizedName = 32,
    CreateActionSet = 33,
    DestroyActionSet = 34,
    CreateAction = 35,
    DestroyAction = 36,
    EnumerateReferenceSpaces = 37,
    GetReferenceSpaceBoundsRect = 38,
}

impl Opcode {
    pub fn from_u64(value: u64) -> Option<Self> {
        Some(match value {
            1 => Self::Handshake,
            2 => Self::CreateInstance,
            3 => Self::CreateSession,
            4 => Self::DestroySession,
            5 => Self::BeginSession,
            6 => Self::EndSession,
            7 => Self::RequestExitSession,
            8 => Self::EnumerateSwapchainFormats,
            9 => Self::CreateSwapchain,
            10 => Self::DestroySwapchain,
            11 => Self::EnumerateSwapchainImages,
            12 => Self::AcquireSwapchainImage,
            13 => Self::WaitSwapchainImage,
            14 => Self::ReleaseSwapchainImage,
            15 => Self::CreateReferenceSpace,
            16 => Self::CreateActionSpace,
            17 => Self::LocateSpace,
            18 => Self::DestroySpace,
            19 => Self::EnumerateViewConfigurations,
            20 => Self::EnumerateViewConfigurationViews,
            21 => Self::GetViewConfigurationProperties,
            22 => Self::GetSystemProperties,
            23 => Self::GetInstanceProperties,
            24 => Self::PollEvent,
            25 => Self::WaitFrame,
            26 => Self::BeginFrame,
            27 => Self::EndFrame,
            28 => Self::SyncActionsAndGetState,
            29 => Self::StopHaptic,
            30 => Self::ApplyHaptic,
            31 => Self::LocateViews,
            32 => Self::GetInputSourceLocalizedName,
            33 => Self::CreateActionSet,
            34 => Self::DestroyActionSet,
            35 => Self::CreateAction,
            36 => Self::DestroyAction,
            37 => Self::EnumerateReferenceSpaces,
            38 => Self::GetReferenceSpaceBoundsRect,
            _ => return None,
        })
    }

    pub fn as_u64(self) -> u64 {
        self as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_roundtrip() {
        for v in 1..=38 {
            let op = Opcode::from_u64(v).unwrap();
            assert_eq!(op.as_u64(), v);
        }
        assert!(Opcode::from_u64(0).is_none());
        assert!(Opcode::from_u64(999).is_none());
    }
}
