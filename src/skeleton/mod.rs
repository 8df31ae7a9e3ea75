//! 骨骼系统
//!
//! 核心设计：
//! - Bone: 单个骨骼节点，行为按封闭枚举 BoneKind 区分
//! - BoneSet: 扁平仲裁数组管理层级结构与每帧两趟解算
//! - IkSolver: CCD 迭代求解器

mod bone;
mod bone_set;
mod ik_solver;

pub use bone::{Bone, BoneFlags, BoneKind};
pub use bone_set::{BoneSet, BoneSpec, IkSpec};
pub use ik_solver::IkSolver;
