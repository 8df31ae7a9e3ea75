//! 整帧管线集成测试
//!
//! 覆盖：
//! - 动作 → 骨骼 → 蒙皮的全链路
//! - IK 在管线内的求解与膝盖铰链约束
//! - 表情轨道驱动顶点 Morph
//! - 开关轨道控制显示与 IK 启用
//! - 物理回写与降级
//! - 多轨优先级分层的最终输出

use std::sync::Arc;

use glam::{Mat4, Quat, Vec3};

use mmd_motion::{
    BoneKind, Character, EngineConfig, ModelBuilder, MotionClip, MotionClipBuilder, PhysicsDriver,
    RigidBodyBinding, SkinBinding,
};
use mmd_motion::morph::{Morph, MorphKind, VertexMorphOffset};
use mmd_motion::skeleton::{BoneSpec, IkSpec};

fn pose_clip(bone: &str, pos: Vec3, max_frame: f32) -> Arc<MotionClip> {
    let mut b = MotionClipBuilder::new();
    b.bone_keyframe_linear(bone, 0.0, pos, Quat::IDENTITY)
        .bone_keyframe_linear(bone, max_frame, pos, Quat::IDENTITY);
    Arc::new(b.build().unwrap())
}

// ============================================================================
// 动作 → 蒙皮全链路
// ============================================================================

#[test]
fn motion_rotation_moves_skinned_vertex() {
    let mut b = ModelBuilder::new(EngineConfig::default());
    let root = b.bone(BoneSpec::new("root", Vec3::ZERO, None));
    b.bone(BoneSpec::new("arm", Vec3::new(0.0, 1.0, 0.0), Some(root)));
    b.vertex(Vec3::new(0.0, 2.0, 0.0), Vec3::Y, SkinBinding::Bdef1 { bone: 1 });
    let mut ch = Character::new(b.build().unwrap());

    let mut clip = MotionClipBuilder::new();
    clip.bone_keyframe_linear("root", 0.0, Vec3::ZERO, Quat::from_rotation_z(std::f32::consts::FRAC_PI_2))
        .bone_keyframe_linear("root", 10.0, Vec3::ZERO, Quat::from_rotation_z(std::f32::consts::FRAC_PI_2));
    ch.start_motion(Arc::new(clip.build().unwrap()), "m", false, false, false, false, 0.0);

    ch.update(1.0);
    // 根骨骼绕 Z 转 90°：顶点 (0,2,0) → (-2,0,0)
    let p = ch.model().skin_output().positions[0];
    assert!((p - Vec3::new(-2.0, 0.0, 0.0)).length() < 1e-4, "{p:?}");
}

#[test]
fn two_priorities_resolve_deterministically() {
    let mut b = ModelBuilder::new(EngineConfig::default());
    b.bone(BoneSpec::new("root", Vec3::ZERO, None));
    b.vertex(Vec3::ZERO, Vec3::Y, SkinBinding::Bdef1 { bone: 0 });
    let mut ch = Character::new(b.build().unwrap());

    ch.start_motion(pose_clip("root", Vec3::Z, 100.0), "high", false, false, false, false, 10.0);
    ch.start_motion(pose_clip("root", Vec3::Y, 100.0), "low", false, false, false, false, 0.0);
    ch.update(1.0);
    let p = ch.model().skin_output().positions[0];
    assert!((p - Vec3::Z).length() < 1e-5, "{p:?}");
}

// ============================================================================
// IK
// ============================================================================

fn leg_model(knee_name: &str, dest: Vec3) -> Character {
    let mut b = ModelBuilder::new(EngineConfig::default());
    let hip = b.bone(BoneSpec::new("hip", Vec3::new(0.0, 2.0, 0.0), None));
    let mut knee = BoneSpec::new(knee_name, Vec3::new(0.0, 1.0, 0.0), Some(hip));
    knee.kind = BoneKind::UnderIk;
    let knee = b.bone(knee);
    let mut ankle = BoneSpec::new("ankle", Vec3::ZERO, Some(knee));
    ankle.kind = BoneKind::IkTarget;
    let ankle = b.bone(ankle);
    let mut dest_spec = BoneSpec::new("ik", dest, None);
    dest_spec.kind = BoneKind::IkDestination;
    let dest_bone = b.bone(dest_spec);
    b.ik(IkSpec {
        destination: dest_bone,
        target: ankle,
        chain: vec![knee, hip],
        iterations: 32,
        angle_constraint: 1.0,
    });
    b.vertex(Vec3::ZERO, Vec3::Y, SkinBinding::Bdef1 { bone: ankle as u32 });
    Character::new(b.build().unwrap())
}

#[test]
fn ik_converges_within_pipeline() {
    let mut ch = leg_model("knee", Vec3::new(0.6, 1.0, 0.3));
    ch.update(1.0);
    let bones = ch.model().bones();
    let ankle = bones.find("ankle").unwrap();
    let ik = bones.find("ik").unwrap();
    let err = bones
        .bone(ankle)
        .world_position()
        .distance(bones.bone(ik).world_position());
    assert!(err < 0.05, "IK error {err}");
}

#[test]
fn knee_hinge_rotates_about_x_only() {
    let mut ch = leg_model("右ひざ", Vec3::new(0.0, 1.0, -0.6));
    ch.update(1.0);
    let bones = ch.model().bones();
    let knee = bones.find("右ひざ").unwrap();
    let rot = bones.bone(knee).rot;
    // 铰链：旋转四元数的 y/z 分量应为零
    assert!(rot.y.abs() < 1e-4 && rot.z.abs() < 1e-4, "{rot:?}");
}

// ============================================================================
// 表情 → Morph → 蒙皮
// ============================================================================

#[test]
fn face_channel_drives_vertex_morph() {
    let mut b = ModelBuilder::new(EngineConfig::default());
    b.bone(BoneSpec::new("root", Vec3::ZERO, None));
    let mut smile = Morph::new("smile", MorphKind::Vertex);
    smile.vertex_offsets.push(VertexMorphOffset {
        vertex_index: 0,
        offset: Vec3::new(0.0, 1.0, 0.0),
    });
    b.morph(smile);
    b.vertex(Vec3::ZERO, Vec3::Y, SkinBinding::Bdef1 { bone: 0 });
    let mut ch = Character::new(b.build().unwrap());

    let mut clip = MotionClipBuilder::new();
    clip.face_keyframe("smile", 0.0, 0.0).face_keyframe("smile", 30.0, 1.0);
    ch.start_motion(Arc::new(clip.build().unwrap()), "f", false, false, false, false, 0.0);

    ch.update(15.0); // 应用第 0 帧，时钟推到 15
    ch.update(0.0); // 应用第 15 帧
    let p = ch.model().skin_output().positions[0];
    assert!((p.y - 0.5).abs() < 1e-5, "{p:?}");
}

// ============================================================================
// 开关轨道
// ============================================================================

#[test]
fn switch_track_controls_display_and_ik() {
    let mut ch = leg_model("knee", Vec3::new(0.6, 1.0, 0.3));

    let mut clip = MotionClipBuilder::new();
    clip.switch_keyframe(0.0, false, vec![("ik".to_string(), false)])
        .switch_keyframe(10.0, false, vec![("ik".to_string(), false)]);
    ch.start_motion(Arc::new(clip.build().unwrap()), "sw", false, false, false, false, 0.0);

    ch.update(1.0);
    assert!(!ch.model().display());
    let bones = ch.model().bones();
    let ik = bones.find("ik").unwrap();
    assert!(!bones.bone(ik).ik_switch());
    // IK 被关闭：终端不应贴近目的地
    let ankle = bones.find("ankle").unwrap();
    let err = bones
        .bone(ankle)
        .world_position()
        .distance(bones.bone(ik).world_position());
    assert!(err > 0.5, "IK should be disabled, error {err}");
}

// ============================================================================
// 物理
// ============================================================================

struct ScriptedDriver {
    trans: Mat4,
    supply: bool,
}

impl PhysicsDriver for ScriptedDriver {
    fn step(&mut self, _delta_seconds: f32) {}
    fn world_transform(&self, _rigid_body: u32) -> Option<Mat4> {
        self.supply.then_some(self.trans)
    }
}

#[test]
fn simulated_bone_moves_skinned_vertex() {
    let mut b = ModelBuilder::new(EngineConfig::default());
    let root = b.bone(BoneSpec::new("root", Vec3::ZERO, None));
    let mut tail = BoneSpec::new("tail", Vec3::new(0.0, 1.0, 0.0), Some(root));
    tail.after_physics = true;
    let tail = b.bone(tail);
    b.vertex(Vec3::new(0.0, 1.0, 0.0), Vec3::Y, SkinBinding::Bdef1 { bone: tail as u32 });
    let mut ch = Character::new(b.build().unwrap());

    ch.attach_physics(
        Box::new(ScriptedDriver {
            trans: Mat4::from_translation(Vec3::new(3.0, 0.0, 0.0)),
            supply: true,
        }),
        vec![RigidBodyBinding { bone: tail, rigid_body: 1 }],
    );
    ch.update(1.0);
    // 物理把 tail 的参考系平移 3：顶点跟随蒙皮变换移动
    let p = ch.model().skin_output().positions[0];
    assert!((p - Vec3::new(3.0, 1.0, 0.0)).length() < 1e-4, "{p:?}");
}

#[test]
fn simulated_ik_chain_is_left_alone() {
    let mut ch = leg_model("knee", Vec3::new(0.6, 1.0, 0.3));
    let knee = ch.model().bones().find("knee").unwrap();
    ch.model_mut().bones_mut().bone_mut(knee).set_simulated_flag(true);
    ch.update(1.0);
    // 链首被物理接管：求解跳过，膝盖保持未旋转
    let rot = ch.model().bones().bone(knee).rot;
    assert!(rot.dot(Quat::IDENTITY).abs() > 1.0 - 1e-6);
}

// ============================================================================
// 停止语义
// ============================================================================

#[test]
fn stop_blends_out_then_removes() {
    let mut b = ModelBuilder::new(EngineConfig::default());
    b.bone(BoneSpec::new("root", Vec3::ZERO, None));
    b.vertex(Vec3::ZERO, Vec3::Y, SkinBinding::Bdef1 { bone: 0 });
    let mut ch = Character::new(b.build().unwrap());

    ch.start_motion(pose_clip("root", Vec3::Y, 1000.0), "m", false, false, true, false, 0.0);
    // 平滑窗口（20 帧）走完，动作完全接管
    for _ in 0..30 {
        ch.update(1.0);
    }
    assert!((ch.model().bones().bone(0).pos - Vec3::Y).length() < 1e-3);

    ch.delete_motion("m");
    ch.update(1.0);
    assert_eq!(ch.motion().players().len(), 1); // 淡出中
    for _ in 0..25 {
        ch.update(1.0);
    }
    assert!(ch.motion().players().is_empty()); // 淡出完成后移除
}
