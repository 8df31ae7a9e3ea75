//! 模型装配与每帧更新管线
//!
//! 每帧的规范顺序：
//! 1. 帧首重置（IK 受控骨骼清零、Morph 累积清零）
//! 2. MotionManager 推进全部播放器，写入骨骼姿态与 Morph 权重
//! 3. 骨骼 Morph 累加到骨骼
//! 4. 物理前姿态解算（拓扑序更新 + IK 求解 + 被旋转骨骼补算）
//! 5. 外部物理步进，回写被模拟骨骼的世界变换
//! 6. 物理后骨骼按层补算
//! 7. 顶点/UV/材质 Morph 求值
//! 8. 蒙皮输出
//!
//! 单线程逐帧驱动；动作的启动/停止/换装在下一次 update 开头生效。

use glam::{Mat4, Vec3};

use crate::config::EngineConfig;
use crate::deform::{SkinOutput, Skinner};
use crate::morph::{Morph, MorphManager};
use crate::motion::{MotionClip, MotionConfigure, MotionManager};
use crate::skeleton::{BoneSet, BoneSpec, IkSpec};
use crate::{MmdError, Result};

use std::sync::Arc;

/// 动作帧率约定：1 帧 = 1/30 秒
pub const FRAMES_PER_SECOND: f64 = 30.0;

// ============================================================================
// 物理接口
// ============================================================================

/// 外部物理引擎接口
///
/// 物理引擎是唯一的骨骼世界变换外部写入者，步进在物理前/物理后
/// 两趟解算之间同步完成。
pub trait PhysicsDriver {
    /// 推进物理世界
    fn step(&mut self, delta_seconds: f32);

    /// 取刚体的世界变换；本帧未产出时返回 None（骨骼退回层级组合）
    fn world_transform(&self, rigid_body: u32) -> Option<Mat4>;

    /// 骨骼被外部重定位后重新锚定刚体
    fn reanchor(&mut self, _rigid_body: u32, _anchor: Mat4) {}
}

/// 骨骼与刚体的绑定
#[derive(Clone, Copy, Debug)]
pub struct RigidBodyBinding {
    /// 骨骼索引
    pub bone: usize,
    /// 物理引擎内的刚体标识
    pub rigid_body: u32,
}

// ============================================================================
// 模型
// ============================================================================

/// 装配完成的角色模型：骨骼 + Morph + 网格 + 蒙皮缓冲
pub struct CharacterModel {
    config: EngineConfig,
    bones: BoneSet,
    morphs: MorphManager,

    rest_positions: Vec<Vec3>,
    rest_normals: Vec<Vec3>,
    /// Morph 处理后的顶点位置（每帧重建）
    morphed_positions: Vec<Vec3>,

    skinner: Skinner,
    skin_out: SkinOutput,

    /// 开关轨道控制的显示标志
    display: bool,
}

impl CharacterModel {
    // ========================================
    // 访问器
    // ========================================

    /// 引擎配置
    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 骨骼集合
    #[inline]
    pub fn bones(&self) -> &BoneSet {
        &self.bones
    }

    /// 可变骨骼集合（物理回写入口）
    #[inline]
    pub fn bones_mut(&mut self) -> &mut BoneSet {
        &mut self.bones
    }

    /// Morph 管理器
    #[inline]
    pub fn morphs(&self) -> &MorphManager {
        &self.morphs
    }

    /// 可变 Morph 管理器
    #[inline]
    pub fn morphs_mut(&mut self) -> &mut MorphManager {
        &mut self.morphs
    }

    /// 顶点数
    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.rest_positions.len()
    }

    /// 蒙皮输出（每帧 update 之后有效）
    #[inline]
    pub fn skin_output(&self) -> &SkinOutput {
        &self.skin_out
    }

    /// 显示标志
    #[inline]
    pub fn display(&self) -> bool {
        self.display
    }

    /// 写显示标志
    #[inline]
    pub fn set_display(&mut self, flag: bool) {
        self.display = flag;
    }

    /// 刚体挂接用：骨骼的绑定姿态锚点变换
    #[inline]
    pub fn bone_anchor(&self, bone: usize) -> Mat4 {
        self.bones.bone(bone).saved_trans()
    }

    // ========================================
    // 管线步骤
    // ========================================

    /// 帧首重置
    pub fn begin_frame(&mut self) {
        self.bones.reset_ik_controlled();
        self.bones.reset_morphs();
    }

    /// 骨骼 Morph 累加（动作写完权重之后、姿态解算之前）
    pub fn apply_bone_morphs(&mut self) {
        self.morphs.apply_bone_morphs(self.bones.bones_mut());
    }

    /// 物理前姿态解算
    pub fn update_pose(&mut self) {
        self.bones.update_before_physics(&self.config);
    }

    /// 物理后骨骼补算
    pub fn update_after_physics(&mut self) {
        self.bones.update_after_physics(&self.config);
    }

    /// 顶点/UV/材质 Morph 求值
    pub fn update_morphs(&mut self) {
        self.morphs
            .apply_vertex_morphs(&self.rest_positions, &mut self.morphed_positions);
        self.morphs.apply_uv_material_morphs();
    }

    /// 蒙皮
    pub fn update_skin(&mut self) {
        self.skinner.update(
            &self.bones,
            &self.morphed_positions,
            &self.rest_normals,
            &mut self.skin_out,
        );
    }
}

// ============================================================================
// 装配器
// ============================================================================

/// 模型装配器
///
/// 所有结构校验都在 `build` 里完成：任何越界引用都使整个装配失败，
/// 不会暴露半合法的模型（运行期蒙皮按已校验索引直接访问）。
pub struct ModelBuilder {
    config: EngineConfig,
    bone_specs: Vec<BoneSpec>,
    ik_specs: Vec<IkSpec>,
    morphs: Vec<Morph>,
    positions: Vec<Vec3>,
    normals: Vec<Vec3>,
    bindings: Vec<crate::deform::SkinBinding>,
    material_count: usize,
}

impl ModelBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            bone_specs: Vec::new(),
            ik_specs: Vec::new(),
            morphs: Vec::new(),
            positions: Vec::new(),
            normals: Vec::new(),
            bindings: Vec::new(),
            material_count: 0,
        }
    }

    /// 追加骨骼，返回其索引
    pub fn bone(&mut self, spec: BoneSpec) -> usize {
        self.bone_specs.push(spec);
        self.bone_specs.len() - 1
    }

    /// 追加 IK 单元
    pub fn ik(&mut self, spec: IkSpec) -> &mut Self {
        self.ik_specs.push(spec);
        self
    }

    /// 追加 Morph
    pub fn morph(&mut self, morph: Morph) -> &mut Self {
        self.morphs.push(morph);
        self
    }

    /// 追加顶点
    pub fn vertex(&mut self, position: Vec3, normal: Vec3, binding: crate::deform::SkinBinding) -> &mut Self {
        self.positions.push(position);
        self.normals.push(normal);
        self.bindings.push(binding);
        self
    }

    /// 材质数量（材质 Morph 结果缓冲按此分配）
    pub fn materials(&mut self, count: usize) -> &mut Self {
        self.material_count = count;
        self
    }

    /// 校验并装配
    pub fn build(self) -> Result<CharacterModel> {
        let bones = BoneSet::build(self.bone_specs, self.ik_specs, &self.config)?;

        let mut morphs = MorphManager::new();
        for morph in self.morphs {
            morphs.add_morph(morph);
        }
        morphs.validate(bones.len(), self.positions.len(), self.material_count)?;
        morphs.init_buffers(self.positions.len(), self.material_count);

        if self.positions.len() != self.normals.len()
            || self.positions.len() != self.bindings.len()
        {
            return Err(MmdError::SkinBinding {
                vertex: self.positions.len().min(self.normals.len()),
                reason: "positions/normals/bindings length mismatch".to_string(),
            });
        }
        let skinner = Skinner::new(self.bindings);
        skinner.validate(bones.len())?;

        let vertex_count = self.positions.len();
        Ok(CharacterModel {
            config: self.config,
            bones,
            morphs,
            rest_positions: self.positions,
            rest_normals: self.normals,
            morphed_positions: vec![Vec3::ZERO; vertex_count],
            skinner,
            skin_out: SkinOutput::default(),
            display: true,
        })
    }
}

// ============================================================================
// 角色
// ============================================================================

/// 角色：模型 + 动作管理器 + 可选的物理对接，一次调用完成整帧更新
pub struct Character {
    model: CharacterModel,
    motion: MotionManager,
    physics_bindings: Vec<RigidBodyBinding>,
    physics: Option<Box<dyn PhysicsDriver>>,
}

impl Character {
    pub fn new(model: CharacterModel) -> Self {
        let motion = MotionManager::new(model.config.clone());
        Self {
            model,
            motion,
            physics_bindings: Vec::new(),
            physics: None,
        }
    }

    /// 模型
    #[inline]
    pub fn model(&self) -> &CharacterModel {
        &self.model
    }

    /// 可变模型
    #[inline]
    pub fn model_mut(&mut self) -> &mut CharacterModel {
        &mut self.model
    }

    /// 动作管理器
    #[inline]
    pub fn motion(&self) -> &MotionManager {
        &self.motion
    }

    /// 挂接物理引擎
    ///
    /// 绑定的骨骼被标记为模拟骨骼（IK 不再与之对抗），
    /// 同时把各骨骼的绑定姿态锚点交给引擎初始化刚体。
    pub fn attach_physics(&mut self, mut driver: Box<dyn PhysicsDriver>, bindings: Vec<RigidBodyBinding>) {
        for binding in &bindings {
            self.model.bones.bone_mut(binding.bone).set_simulated_flag(true);
            driver.reanchor(binding.rigid_body, self.model.bone_anchor(binding.bone));
        }
        self.physics_bindings = bindings;
        self.physics = Some(driver);
    }

    /// 摘除物理引擎
    pub fn detach_physics(&mut self) {
        for binding in &self.physics_bindings {
            self.model.bones.bone_mut(binding.bone).set_simulated_flag(false);
        }
        self.model.bones.clear_simulated_transforms();
        self.physics_bindings.clear();
        self.physics = None;
    }

    // ========================================
    // 动作指令（名称寻址，未知名称返回 false）
    // ========================================

    /// 启动动作
    #[allow(clippy::too_many_arguments)]
    pub fn start_motion(
        &mut self,
        clip: Arc<MotionClip>,
        name: &str,
        full: bool,
        once: bool,
        smooth: bool,
        repos: bool,
        priority: f32,
    ) -> bool {
        self.motion.start_motion(
            &mut self.model.bones,
            &self.model.morphs,
            clip,
            name,
            full,
            once,
            smooth,
            repos,
            priority,
        )
    }

    /// 换装动作
    pub fn swap_motion(&mut self, clip: Arc<MotionClip>, name: &str) -> bool {
        self.motion
            .swap_motion(&mut self.model.bones, &self.model.morphs, clip, name)
    }

    /// 停止动作（淡出后移除）
    pub fn delete_motion(&mut self, name: &str) -> bool {
        self.motion.delete_motion(name)
    }

    /// 调整动作通道配置
    pub fn configure_motion(&mut self, name: &str, cfg: &MotionConfigure) -> bool {
        self.motion.configure_motion(name, cfg)
    }

    /// 设定动作速度倍率
    pub fn set_motion_speed_rate(
        &mut self,
        name: &str,
        speed_rate: f32,
        change_length: f32,
        target_frame: Option<f32>,
    ) -> bool {
        self.motion
            .set_motion_speed_rate(name, speed_rate, change_length, target_frame)
    }

    // ========================================
    // 整帧更新
    // ========================================

    /// 推进一帧（delta 单位为动作帧），返回是否有动作状态变化
    pub fn update(&mut self, delta_frame: f64) -> bool {
        // 1. 帧首重置
        self.model.begin_frame();

        // 2. 动作写入骨骼姿态与 Morph 权重
        let changed = self
            .motion
            .update(&mut self.model.bones, &mut self.model.morphs, delta_frame);
        if let Some(display) = self.motion.take_display_request() {
            self.model.set_display(display);
        }

        // 3. 骨骼 Morph
        self.model.apply_bone_morphs();

        // 4. 物理前姿态解算（含 IK 与被旋转骨骼）
        self.model.update_pose();

        // 5. 物理步进并回写模拟骨骼
        self.model.bones.clear_simulated_transforms();
        if let Some(driver) = &mut self.physics {
            driver.step((delta_frame / FRAMES_PER_SECOND) as f32);
            for binding in &self.physics_bindings {
                match driver.world_transform(binding.rigid_body) {
                    Some(trans) => {
                        self.model.bones.supply_simulated_transform(binding.bone, trans);
                    }
                    None => {
                        // 物理本帧缺数据：骨骼退回层级组合（§降级），不留未定义状态
                        log::debug!(
                            "[physics] no transform for rigid body {} this tick",
                            binding.rigid_body
                        );
                    }
                }
            }
        }

        // 6. 物理后骨骼补算
        self.model.update_after_physics();

        // 7. Morph 求值、8. 蒙皮
        self.model.update_morphs();
        self.model.update_skin();

        // 变速状态机随帧推进
        self.motion.update_speed_rates(delta_frame);

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deform::SkinBinding;
    use crate::motion::MotionClipBuilder;
    use glam::Quat;

    fn three_bone_model() -> CharacterModel {
        let mut b = ModelBuilder::new(EngineConfig::default());
        let root = b.bone(BoneSpec::new("root", Vec3::ZERO, None));
        let mid = b.bone(BoneSpec::new("mid", Vec3::new(0.0, 1.0, 0.0), Some(root)));
        let _tip = b.bone(BoneSpec::new("tip", Vec3::new(0.0, 2.0, 0.0), Some(mid)));
        b.vertex(Vec3::new(0.1, 0.0, 0.0), Vec3::Y, SkinBinding::Bdef1 { bone: 0 });
        b.vertex(Vec3::new(0.2, 0.5, 0.0), Vec3::Y, SkinBinding::Bdef1 { bone: 0 });
        b.build().unwrap()
    }

    #[test]
    fn rest_pose_skins_to_rest_positions() {
        // 无动作时，全部顶点绑定根骨骼的模型蒙皮后保持静置位置
        let mut ch = Character::new(three_bone_model());
        ch.update(1.0);
        let out = ch.model().skin_output();
        assert!((out.positions[0] - Vec3::new(0.1, 0.0, 0.0)).length() < 1e-6);
        assert!((out.positions[1] - Vec3::new(0.2, 0.5, 0.0)).length() < 1e-6);
    }

    #[test]
    fn zero_delta_update_is_idempotent() {
        let mut ch = Character::new(three_bone_model());
        let mut clip = MotionClipBuilder::new();
        clip.bone_keyframe_linear("mid", 0.0, Vec3::ZERO, Quat::IDENTITY)
            .bone_keyframe_linear("mid", 30.0, Vec3::ZERO, Quat::from_rotation_z(1.0));
        ch.start_motion(Arc::new(clip.build().unwrap()), "m", false, false, false, false, 0.0);

        ch.update(7.0);
        ch.update(0.0);
        let first: Vec<Vec3> = ch.model().skin_output().positions.clone();
        ch.update(0.0);
        let second = &ch.model().skin_output().positions;
        for (a, b) in first.iter().zip(second.iter()) {
            assert!((*a - *b).length() < 1e-7);
        }
    }

    #[test]
    fn motion_drives_skin_output() {
        let mut b = ModelBuilder::new(EngineConfig::default());
        b.bone(BoneSpec::new("root", Vec3::ZERO, None));
        b.vertex(Vec3::ZERO, Vec3::Y, SkinBinding::Bdef1 { bone: 0 });
        let mut ch = Character::new(b.build().unwrap());

        let mut clip = MotionClipBuilder::new();
        clip.bone_keyframe_linear("root", 0.0, Vec3::new(3.0, 0.0, 0.0), Quat::IDENTITY)
            .bone_keyframe_linear("root", 10.0, Vec3::new(3.0, 0.0, 0.0), Quat::IDENTITY);
        ch.start_motion(Arc::new(clip.build().unwrap()), "m", false, false, false, false, 0.0);
        ch.update(1.0);
        assert!((ch.model().skin_output().positions[0] - Vec3::new(3.0, 0.0, 0.0)).length() < 1e-5);
    }

    struct FixedDriver {
        trans: Option<Mat4>,
    }

    impl PhysicsDriver for FixedDriver {
        fn step(&mut self, _delta_seconds: f32) {}
        fn world_transform(&self, _rigid_body: u32) -> Option<Mat4> {
            self.trans
        }
    }

    #[test]
    fn physics_transform_overrides_bone() {
        let mut b = ModelBuilder::new(EngineConfig::default());
        let root = b.bone(BoneSpec::new("root", Vec3::ZERO, None));
        let mut tail = BoneSpec::new("tail", Vec3::new(0.0, 1.0, 0.0), Some(root));
        tail.after_physics = true;
        b.bone(tail);
        b.vertex(Vec3::new(0.0, 1.0, 0.0), Vec3::Y, SkinBinding::Bdef1 { bone: 1 });
        let mut ch = Character::new(b.build().unwrap());

        let sim = Mat4::from_translation(Vec3::new(5.0, 1.0, 0.0));
        ch.attach_physics(
            Box::new(FixedDriver { trans: Some(sim) }),
            vec![RigidBodyBinding { bone: 1, rigid_body: 7 }],
        );
        ch.update(1.0);
        // tail 的世界变换 = 物理变换 ∘ 本地（offset 已含在锚定差里，这里本地为零位移）
        let p = ch.model().bones().bone(1).world_position();
        assert!((p - Vec3::new(5.0, 2.0, 0.0)).length() < 1e-4, "{p:?}");
    }

    #[test]
    fn physics_desync_falls_back_to_hierarchy() {
        let mut b = ModelBuilder::new(EngineConfig::default());
        let root = b.bone(BoneSpec::new("root", Vec3::ZERO, None));
        let mut tail = BoneSpec::new("tail", Vec3::new(0.0, 1.0, 0.0), Some(root));
        tail.after_physics = true;
        b.bone(tail);
        b.vertex(Vec3::new(0.0, 1.0, 0.0), Vec3::Y, SkinBinding::Bdef1 { bone: 1 });
        let mut ch = Character::new(b.build().unwrap());

        ch.attach_physics(
            Box::new(FixedDriver { trans: None }),
            vec![RigidBodyBinding { bone: 1, rigid_body: 7 }],
        );
        ch.update(1.0);
        // 物理缺数据：退回父骨骼组合，保持绑定位置
        let p = ch.model().bones().bone(1).world_position();
        assert!((p - Vec3::new(0.0, 1.0, 0.0)).length() < 1e-5, "{p:?}");
    }

    #[test]
    fn builder_rejects_mismatched_or_invalid_skin() {
        let mut b = ModelBuilder::new(EngineConfig::default());
        b.bone(BoneSpec::new("root", Vec3::ZERO, None));
        b.vertex(Vec3::ZERO, Vec3::Y, SkinBinding::Bdef1 { bone: 9 });
        assert!(matches!(b.build(), Err(MmdError::SkinBinding { .. })));
    }

    #[test]
    fn bone_lookup_miss_returns_none() {
        let model = three_bone_model();
        assert!(model.bones().find("missing").is_none());
        assert!(model.morphs().find("missing").is_none());
    }
}
