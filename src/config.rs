//! 引擎配置
//!
//! 所有参数扁平化，按实例传入而非全局状态，
//! 同一进程内的多个角色可以携带不同配置。

/// IK 数值容差
///
/// 这些常量是经验调参的结果，没有物理推导依据，
/// 按可配置容差处理，不要当作精确的物理量。
#[derive(Debug, Clone)]
pub struct IkTolerances {
    /// 目标与终端距离平方的收敛阈值
    pub min_distance_sq: f32,
    /// 单步旋转角下限（弧度），低于此值跳过该链节
    pub min_angle: f32,
    /// 旋转轴长度平方下限，低于此值视为方向近平行
    pub min_axis_sq: f32,
    /// 膝盖单轴累计角下限
    pub min_rot_sum: f32,
    /// 膝盖限制后旋转角下限
    pub min_rotation: f32,
}

impl Default for IkTolerances {
    fn default() -> Self {
        Self {
            min_distance_sq: 0.0001,
            min_angle: 0.000_000_01,
            min_axis_sq: 0.000_001,
            min_rot_sum: 0.002,
            min_rotation: 0.000_01,
        }
    }
}

/// 引擎配置（扁平化，不嵌套）
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // ========== 动作平滑 ==========
    /// 骨骼通道起始平滑帧数，默认 20.0
    pub bone_start_margin: f32,
    /// 表情通道起始平滑帧数，默认 6.0
    pub face_start_margin: f32,
    /// 骨骼通道结束淡出帧数，默认 20.0
    pub bone_end_margin: f32,
    /// 表情通道结束淡出帧数，默认 6.0
    pub face_end_margin: f32,
    /// full 模式启动时，未被新动作控制的骨骼/表情
    /// 在此帧数内渐进回到中立姿态，默认 10.0
    pub non_controlled_reset_frames: f32,

    // ========== 循环 ==========
    /// 循环动作回绕到的默认帧号，默认 0.0
    pub default_loop_at: f32,

    // ========== 命名约定 ==========
    /// 中心骨骼名
    pub center_bone_name: String,
    /// 名称包含此子串的骨骼在 IK 中按单轴铰链处理（膝盖约定）
    pub knee_bone_mark: String,
    /// 辅助根骨骼名，其子骨骼视为运动独立
    pub auxiliary_root_names: Vec<String>,

    // ========== IK ==========
    /// IK 数值容差
    pub ik: IkTolerances,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bone_start_margin: 20.0,
            face_start_margin: 6.0,
            bone_end_margin: 20.0,
            face_end_margin: 6.0,
            non_controlled_reset_frames: 10.0,

            default_loop_at: 0.0,

            center_bone_name: "センター".to_string(),
            knee_bone_mark: "ひざ".to_string(),
            auxiliary_root_names: vec![
                "全ての親".to_string(),
                "両足オフセ".to_string(),
                "右足オフセ".to_string(),
                "左足オフセ".to_string(),
            ],

            ik: IkTolerances::default(),
        }
    }
}
