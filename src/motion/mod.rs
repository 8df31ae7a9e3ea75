//! 动作系统
//!
//! - curve:      关键帧缓动查表（装配期解三次根，播放期查表）
//! - clip:       不可变动作数据（骨骼/表情/相机/开关轨道）
//! - controller: 单轨播放与起始/循环平滑
//! - manager:    多轨分层、优先级、淡出与变速
//! - camera:     相机轨道播放

pub mod camera;
pub mod clip;
pub mod controller;
pub mod curve;
pub mod manager;

pub use camera::{CameraController, CameraState};
pub use clip::{
    BoneChannel, BoneKeyframe, CameraKeyframe, FaceChannel, FaceKeyframe, Interp, MotionClip,
    MotionClipBuilder, SwitchKeyframe,
};
pub use controller::{ApplyMode, MotionConfigure, MotionController};
pub use curve::{CurveSpec, EaseCache, EaseCurve};
pub use manager::{EndBehavior, MotionManager, MotionPlayer, MotionStatus};
