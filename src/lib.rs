//! 角色动画运行时核心
//!
//! 每个模拟帧执行一次 `update`，将骨骼层级、IK 求解、多轨动作混合、
//! Morph 累积与物理回写统一调度，最终输出每顶点的蒙皮结果。
//!
//! 模块划分：
//! - skeleton: 骨骼图（BoneSet 扁平仲裁数组 + IK 求解器）
//! - motion:   动作数据（MotionClip）、单轨播放（MotionController）、
//!             多轨管理（MotionManager）、相机轨道
//! - morph:    Morph 注册表与每帧应用
//! - deform:   CPU 蒙皮（BDEF1/2/4 + SDEF）
//! - model:    模型装配校验与每帧更新管线
//!
//! 文件解析、渲染、物理引擎本体均不在本 crate 范围内：
//! 加载器负责产出已解析的内存结构，物理通过 `PhysicsDriver` trait 对接。

pub mod config;
pub mod deform;
pub mod model;
pub mod morph;
pub mod motion;
pub mod skeleton;

use thiserror::Error;

/// 装配期结构错误
///
/// 所有索引/引用校验都在装配期完成并使整个加载失败；
/// 运行期的名称查找失败返回 `Option`/`false`，不会产生错误。
#[derive(Error, Debug)]
pub enum MmdError {
    /// 骨骼引用越界（父骨骼/子骨骼/目标骨骼）
    #[error("bone '{bone}' references invalid bone index {index}")]
    BoneIndex { bone: String, index: usize },

    /// 骨骼父链存在环
    #[error("bone '{bone}' has a cyclic parent chain")]
    BoneCycle { bone: String },

    /// IK 配置引用越界
    #[error("IK unit references invalid {which} bone index {index}")]
    IkIndex { which: &'static str, index: usize },

    /// Morph 成员引用越界
    #[error("morph '{morph}' references invalid index {index}")]
    MorphIndex { morph: String, index: usize },

    /// 顶点蒙皮绑定非法（骨骼越界或权重不归一）
    #[error("vertex {vertex} has invalid skin binding: {reason}")]
    SkinBinding { vertex: usize, reason: String },

    /// 关键帧序非法（帧号必须非递减）
    #[error("channel '{channel}' has decreasing keyframe at frame {frame}")]
    KeyframeOrder { channel: String, frame: f32 },
}

/// crate 统一 Result 别名
pub type Result<T> = std::result::Result<T, MmdError>;

pub use config::{EngineConfig, IkTolerances};
pub use deform::{SkinBinding, SkinOutput, Skinner};
pub use model::{Character, CharacterModel, ModelBuilder, PhysicsDriver, RigidBodyBinding};
pub use morph::{Morph, MorphKind, MorphManager};
pub use motion::{
    ApplyMode, CameraController, CameraState, EndBehavior, MotionClip, MotionClipBuilder,
    MotionConfigure, MotionController, MotionManager, MotionStatus,
};
pub use skeleton::{Bone, BoneKind, BoneSet, IkSolver};
