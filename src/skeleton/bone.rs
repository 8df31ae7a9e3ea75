//! 骨骼节点
//!
//! 骨骼行为按封闭枚举 `BoneKind` 区分，协动/被旋转链接直接放在变体里，
//! 装配期就能保证链接存在，运行期无需判空。
//! 世界变换 = 父骨骼世界变换 ∘ 本地变换，由 `update_bone` 按拓扑序组合。

use bitflags::bitflags;
use glam::{Mat4, Quat, Vec3};

// ============================================================================
// 骨骼种类
// ============================================================================

/// 骨骼种类
///
/// 协动/被旋转骨骼的链接索引指向所属 `BoneSet` 仲裁数组，
/// 每个变体的更新公式在 `update_bone` 中各实现一次。
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BoneKind {
    /// 普通骨骼
    Normal,
    /// 模型根骨骼
    Root,
    /// 不显示骨骼（仅影响调试绘制，更新规则同普通骨骼）
    NoDisplay,
    /// IK 目的地骨骼（链条要逼近的锚点）
    IkDestination,
    /// IK 终端骨骼（被拖向目的地）
    IkTarget,
    /// IK 链上的骨骼（姿态完全由求解器决定）
    UnderIk,
    /// 被旋转骨骼：旋转被目标骨骼的当前旋转完全覆盖
    UnderRotate { target: usize },
    /// 协旋转骨骼：在本地旋转上追加子骨骼旋转的按系数插值
    CoRotate { child: usize, coef: f32 },
    /// 协移动骨骼：在本地位移上累加子骨骼位移的按系数缩放
    CoMove { child: usize, coef: f32 },
}

bitflags! {
    /// 骨骼状态标志
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BoneFlags: u32 {
        /// IK 过程中只绕本地 X 轴弯曲（膝盖约定）
        const LIMIT_ANGLE_X = 1 << 0;
        /// 不受其它控制骨骼影响（无父骨骼，或父骨骼为辅助根）
        const MOTION_INDEPENDENT = 1 << 1;
        /// 物理步之后再组合变换
        const AFTER_PHYSICS = 1 << 2;
        /// 本帧由物理模拟控制
        const SIMULATED = 1 << 3;
        /// IK 开关（switch 轨道可关闭）
        const IK_SWITCH = 1 << 4;
    }
}

// ============================================================================
// 骨骼节点
// ============================================================================

/// 骨骼节点
///
/// 静态数据在装配后不变；动态数据（pos/rot/morph 累积/世界变换）
/// 每帧由动作、IK 与物理回写。
#[derive(Clone, Debug)]
pub struct Bone {
    /// 骨骼名（模型内唯一）
    pub name: String,
    /// 仲裁数组内索引
    pub(crate) id: usize,
    /// 骨骼种类
    pub kind: BoneKind,
    /// 父骨骼索引
    pub parent: Option<usize>,
    /// 绑定姿态位置（装配后不变）
    pub origin_position: Vec3,
    /// 相对父骨骼的固定偏移（装配期预计算）
    pub offset: Vec3,
    /// 物理后处理层号，层内有依赖的骨骼按层升序处理
    pub process_layer: i32,
    /// 状态标志
    pub flags: BoneFlags,

    /// 当前本地位移（动作/IK 每帧写入）
    pub pos: Vec3,
    /// 当前本地旋转
    pub rot: Quat,
    /// Morph 累积位移（叠加在本地位移之上，单独重置）
    pub morph_pos: Vec3,
    /// Morph 累积旋转
    pub morph_rot: Quat,

    /// 世界变换（旋转+平移），每帧重算
    pub trans: Mat4,
    /// 本帧物理提供的世界变换
    pub(crate) trans_by_simulation: Option<Mat4>,
    /// 保存的变换（刚体挂接时作为锚点姿态）
    pub(crate) saved_trans: Mat4,
}

impl Bone {
    /// 创建新骨骼
    pub fn new(name: impl Into<String>, origin_position: Vec3) -> Self {
        Self {
            name: name.into(),
            id: 0,
            kind: BoneKind::Normal,
            parent: None,
            origin_position,
            offset: origin_position,
            process_layer: 0,
            flags: BoneFlags::IK_SWITCH,
            pos: Vec3::ZERO,
            rot: Quat::IDENTITY,
            morph_pos: Vec3::ZERO,
            morph_rot: Quat::IDENTITY,
            trans: Mat4::from_translation(origin_position),
            trans_by_simulation: None,
            saved_trans: Mat4::IDENTITY,
        }
    }

    /// 重置本地姿态，世界变换回到绑定位置
    ///
    /// 刚体装配期会参照此默认变换，所以不能只清 pos/rot
    pub fn reset(&mut self) {
        self.pos = Vec3::ZERO;
        self.rot = Quat::IDENTITY;
        self.trans = Mat4::from_translation(self.origin_position);
    }

    /// 重置 Morph 累积量
    #[inline]
    pub fn reset_morph(&mut self) {
        self.morph_pos = Vec3::ZERO;
        self.morph_rot = Quat::IDENTITY;
    }

    /// 累加 Morph 位移与旋转
    #[inline]
    pub fn add_morph(&mut self, pos: Vec3, rot: Quat) {
        self.morph_pos += pos;
        self.morph_rot = rot * self.morph_rot;
    }

    /// 预计算相对父骨骼的固定偏移
    pub fn compute_offset(&mut self, parent_origin: Option<Vec3>) {
        self.offset = match parent_origin {
            Some(p) => self.origin_position - p,
            None => self.origin_position,
        };
    }

    // ========================================
    // 访问器
    // ========================================

    /// 仲裁数组内索引
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// 世界位置
    #[inline]
    pub fn world_position(&self) -> Vec3 {
        self.trans.col(3).truncate()
    }

    /// 世界旋转
    #[inline]
    pub fn world_rotation(&self) -> Quat {
        Quat::from_mat4(&self.trans)
    }

    /// 蒙皮变换：世界变换 ∘ 平移(-绑定位置)
    #[inline]
    pub fn skinning_trans(&self) -> Mat4 {
        self.trans * Mat4::from_translation(-self.origin_position)
    }

    /// 保存当前变换（刚体锚点用）
    #[inline]
    pub fn save_trans(&mut self) {
        self.saved_trans = self.trans;
    }

    /// 取保存的变换
    #[inline]
    pub fn saved_trans(&self) -> Mat4 {
        self.saved_trans
    }

    /// 是否本帧由物理控制
    #[inline]
    pub fn is_simulated(&self) -> bool {
        self.flags.contains(BoneFlags::SIMULATED)
    }

    /// 设置物理控制标志
    #[inline]
    pub fn set_simulated_flag(&mut self, flag: bool) {
        self.flags.set(BoneFlags::SIMULATED, flag);
    }

    /// IK 开关
    #[inline]
    pub fn ik_switch(&self) -> bool {
        self.flags.contains(BoneFlags::IK_SWITCH)
    }

    /// 设置 IK 开关
    #[inline]
    pub fn set_ik_switch(&mut self, flag: bool) {
        self.flags.set(BoneFlags::IK_SWITCH, flag);
    }

    /// 是否物理步后处理
    #[inline]
    pub fn after_physics(&self) -> bool {
        self.flags.contains(BoneFlags::AFTER_PHYSICS)
    }

    /// 是否运动独立
    #[inline]
    pub fn motion_independent(&self) -> bool {
        self.flags.contains(BoneFlags::MOTION_INDEPENDENT)
    }

    /// 记录本帧物理提供的世界变换，并立即生效
    pub fn set_trans_by_simulation(&mut self, trans: Mat4) {
        self.trans = trans;
        self.trans_by_simulation = Some(trans);
    }

    /// 清除本帧物理变换记录
    #[inline]
    pub fn clear_trans_by_simulation(&mut self) {
        self.trans_by_simulation = None;
    }
}

// ============================================================================
// 变换组合
// ============================================================================

/// 组合本地变换（位移、旋转），按种类应用覆盖规则
fn compose_local(bones: &[Bone], index: usize) -> Mat4 {
    let bone = &bones[index];
    let mut p = bone.pos + bone.morph_pos;
    let mut r = bone.morph_rot * bone.rot;

    match bone.kind {
        BoneKind::CoMove { child, coef } => {
            if coef != 0.0 {
                p += (bones[child].pos + bones[child].morph_pos) * coef;
            }
        }
        BoneKind::UnderRotate { target } => {
            // 旋转被目标骨骼的当前旋转完全覆盖，位移仍用本地值
            r = bones[target].rot;
        }
        BoneKind::CoRotate { child, coef } => {
            let child_rot = bones[child].rot;
            r = if coef >= 0.0 {
                r * Quat::IDENTITY.slerp(child_rot, coef)
            } else {
                r * Quat::IDENTITY.slerp(child_rot.inverse(), -coef)
            };
        }
        _ => {}
    }

    Mat4::from_rotation_translation(r, p + bone.offset)
}

/// 更新单个骨骼的世界变换
///
/// 前提：父骨骼的世界变换本帧已更新（由 BoneSet 的拓扑序保证）
pub(crate) fn update_bone(bones: &mut [Bone], index: usize) {
    let local = compose_local(bones, index);
    bones[index].trans = match bones[index].parent {
        Some(p) => bones[p].trans * local,
        None => local,
    };
}

/// 物理步之后更新单个骨骼的世界变换
///
/// 本帧有物理变换时，物理结果取代父骨骼组合（物理优先）；
/// 物理未提供时退回普通的父骨骼组合（desync 降级）。
pub(crate) fn update_bone_after_simulation(bones: &mut [Bone], index: usize) {
    let local = compose_local(bones, index);
    bones[index].trans = match bones[index].trans_by_simulation {
        Some(sim) => sim * local,
        None => match bones[index].parent {
            Some(p) => bones[p].trans * local,
            None => local,
        },
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    fn approx_vec3(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-5
    }

    fn approx_quat(a: Quat, b: Quat) -> bool {
        a.dot(b).abs() > 1.0 - 1e-5
    }

    fn make_chain() -> Vec<Bone> {
        // root(0,0,0) -> mid(0,1,0) -> tip(0,2,0)
        let mut root = Bone::new("root", Vec3::ZERO);
        root.id = 0;
        let mut mid = Bone::new("mid", Vec3::new(0.0, 1.0, 0.0));
        mid.id = 1;
        mid.parent = Some(0);
        let mut tip = Bone::new("tip", Vec3::new(0.0, 2.0, 0.0));
        tip.id = 2;
        tip.parent = Some(1);
        let mut bones = vec![root, mid, tip];
        for i in 0..bones.len() {
            let parent_origin = bones[i].parent.map(|p| bones[p].origin_position);
            bones[i].compute_offset(parent_origin);
        }
        bones
    }

    #[test]
    fn world_equals_parent_compose_local() {
        let mut bones = make_chain();
        bones[0].rot = Quat::from_rotation_z(FRAC_PI_2);
        for i in 0..3 {
            update_bone(&mut bones, i);
        }
        // 根骨骼绕 Z 转 90°，子骨骼 (0,1,0) 应到 (-1,0,0)
        assert!(approx_vec3(bones[1].world_position(), Vec3::new(-1.0, 0.0, 0.0)));
        assert!(approx_vec3(bones[2].world_position(), Vec3::new(-2.0, 0.0, 0.0)));

        // 显式验证 world = parent.world ∘ local
        let local = Mat4::from_rotation_translation(bones[2].rot, bones[2].pos + bones[2].offset);
        let expect = bones[1].trans * local;
        assert!(approx_vec3(
            bones[2].trans.col(3).truncate(),
            expect.col(3).truncate()
        ));
    }

    #[test]
    fn rest_pose_is_identity_path() {
        let mut bones = make_chain();
        for i in 0..3 {
            update_bone(&mut bones, i);
        }
        for b in &bones {
            assert!(approx_vec3(b.world_position(), b.origin_position));
            assert!(approx_quat(b.world_rotation(), Quat::IDENTITY));
        }
    }

    #[test]
    fn co_rotate_follows_child_scaled() {
        let mut bones = make_chain();
        bones[2].rot = Quat::from_rotation_x(1.0);
        bones[1].kind = BoneKind::CoRotate { child: 2, coef: 0.5 };
        for i in 0..3 {
            update_bone(&mut bones, i);
        }
        let expect = Quat::IDENTITY.slerp(Quat::from_rotation_x(1.0), 0.5);
        assert!(approx_quat(bones[1].world_rotation(), expect));
    }

    #[test]
    fn co_rotate_negative_coef_uses_inverse() {
        let mut bones = make_chain();
        let child_rot = Quat::from_rotation_y(0.8);
        bones[2].rot = child_rot;
        bones[1].kind = BoneKind::CoRotate { child: 2, coef: -0.5 };
        for i in 0..3 {
            update_bone(&mut bones, i);
        }
        let expect = Quat::IDENTITY.slerp(child_rot.inverse(), 0.5);
        assert!(approx_quat(bones[1].world_rotation(), expect));
    }

    #[test]
    fn co_move_accumulates_child_translation() {
        let mut bones = make_chain();
        bones[2].pos = Vec3::new(2.0, 0.0, 0.0);
        bones[1].kind = BoneKind::CoMove { child: 2, coef: 0.25 };
        for i in 0..2 {
            update_bone(&mut bones, i);
        }
        assert!(approx_vec3(
            bones[1].world_position(),
            Vec3::new(0.5, 1.0, 0.0)
        ));
    }

    #[test]
    fn under_rotate_overwrites_rotation() {
        let mut bones = make_chain();
        bones[1].rot = Quat::from_rotation_z(1.2);
        bones[2].rot = Quat::from_rotation_x(FRAC_PI_2);
        bones[1].kind = BoneKind::UnderRotate { target: 2 };
        update_bone(&mut bones, 0);
        update_bone(&mut bones, 1);
        assert!(approx_quat(
            bones[1].world_rotation(),
            Quat::from_rotation_x(FRAC_PI_2)
        ));
    }

    #[test]
    fn simulation_transform_wins_over_hierarchy() {
        let mut bones = make_chain();
        let sim = Mat4::from_rotation_translation(Quat::from_rotation_y(0.3), Vec3::new(5.0, 0.0, 0.0));
        bones[1].set_trans_by_simulation(sim);
        update_bone_after_simulation(&mut bones, 1);
        let local = Mat4::from_translation(bones[1].offset);
        let expect = (sim * local).col(3).truncate();
        assert!(approx_vec3(bones[1].world_position(), expect));

        // 物理未提供时退回父骨骼组合
        bones[1].clear_trans_by_simulation();
        update_bone(&mut bones, 0);
        update_bone_after_simulation(&mut bones, 1);
        assert!(approx_vec3(bones[1].world_position(), Vec3::new(0.0, 1.0, 0.0)));
    }

    #[test]
    fn morph_accumulates_on_top() {
        let mut bones = make_chain();
        bones[1].pos = Vec3::new(1.0, 0.0, 0.0);
        bones[1].add_morph(Vec3::new(0.0, 0.0, 2.0), Quat::IDENTITY);
        bones[1].add_morph(Vec3::new(0.0, 0.0, 1.0), Quat::IDENTITY);
        update_bone(&mut bones, 0);
        update_bone(&mut bones, 1);
        assert!(approx_vec3(
            bones[1].world_position(),
            Vec3::new(1.0, 1.0, 3.0)
        ));
        bones[1].reset_morph();
        update_bone(&mut bones, 1);
        assert!(approx_vec3(
            bones[1].world_position(),
            Vec3::new(1.0, 1.0, 0.0)
        ));
    }
}
