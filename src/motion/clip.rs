//! 动作数据
//!
//! 一段动作 = 每骨骼/每表情的有序关键帧序列，外加可选的相机与开关轨道。
//! 装配后不可变，通过 `Arc` 被任意多个播放器只读共享。

use std::collections::HashMap;
use std::sync::Arc;

use glam::{Quat, Vec3};

use crate::{MmdError, Result};

use super::curve::{CurveSpec, EaseCache, EaseCurve};

// ============================================================================
// 插值方式
// ============================================================================

/// 单个子通道的插值方式
///
/// 控制点在对角线上时直接用线性权重；否则查预生成的缓动表。
#[derive(Clone, Debug)]
pub enum Interp {
    /// 线性
    Linear,
    /// 查表缓动
    Eased(Arc<EaseCurve>),
}

impl Interp {
    /// 由量化控制点生成，经由缓存共享相同参数的表
    pub fn from_spec(spec: CurveSpec, cache: &EaseCache) -> Self {
        if spec.is_linear() {
            Interp::Linear
        } else {
            Interp::Eased(cache.get_or_build(spec))
        }
    }

    /// 把线性权重映射为实际混合权重
    #[inline]
    pub fn apply(&self, w: f32) -> f32 {
        match self {
            Interp::Linear => w,
            Interp::Eased(curve) => curve.value(w),
        }
    }
}

// ============================================================================
// 关键帧
// ============================================================================

/// 骨骼关键帧：x/y/z/旋转 四个子通道各带独立插值
#[derive(Clone, Debug)]
pub struct BoneKeyframe {
    pub frame: f32,
    pub pos: Vec3,
    pub rot: Quat,
    /// 子通道插值：[x, y, z, 旋转]
    pub interp: [Interp; 4],
}

/// 表情关键帧：帧号 + 权重，帧间线性
#[derive(Clone, Copy, Debug)]
pub struct FaceKeyframe {
    pub frame: f32,
    pub weight: f32,
}

/// 相机关键帧：六个子通道（x/y/z/角度/距离/视野）各带独立插值
#[derive(Clone, Debug)]
pub struct CameraKeyframe {
    pub frame: f32,
    pub distance: f32,
    pub pos: Vec3,
    /// 欧拉角（度）
    pub angle: Vec3,
    pub fovy: f32,
    /// 子通道插值：[x, y, z, 角度, 距离, 视野]
    pub interp: [Interp; 6],
}

/// 开关关键帧：模型显示 + 各 IK 的启用状态
#[derive(Clone, Debug)]
pub struct SwitchKeyframe {
    pub frame: f32,
    pub display: bool,
    /// (IK 目的地骨骼名, 启用)
    pub ik_enable: Vec<(String, bool)>,
}

/// 单骨骼通道
#[derive(Clone, Debug)]
pub struct BoneChannel {
    pub name: String,
    pub keyframes: Vec<BoneKeyframe>,
}

/// 单表情通道
#[derive(Clone, Debug)]
pub struct FaceChannel {
    pub name: String,
    pub keyframes: Vec<FaceKeyframe>,
}

// ============================================================================
// 动作数据
// ============================================================================

/// 一段不可变动作
pub struct MotionClip {
    bone_channels: Vec<BoneChannel>,
    face_channels: Vec<FaceChannel>,
    camera: Vec<CameraKeyframe>,
    switches: Vec<SwitchKeyframe>,
    name_to_bone: HashMap<String, usize>,
    name_to_face: HashMap<String, usize>,
    max_frame: f32,
}

impl MotionClip {
    /// 全部骨骼通道
    #[inline]
    pub fn bone_channels(&self) -> &[BoneChannel] {
        &self.bone_channels
    }

    /// 全部表情通道
    #[inline]
    pub fn face_channels(&self) -> &[FaceChannel] {
        &self.face_channels
    }

    /// 相机轨道
    #[inline]
    pub fn camera_keyframes(&self) -> &[CameraKeyframe] {
        &self.camera
    }

    /// 开关轨道
    #[inline]
    pub fn switch_keyframes(&self) -> &[SwitchKeyframe] {
        &self.switches
    }

    /// 按名称找骨骼通道
    #[inline]
    pub fn bone_channel(&self, name: &str) -> Option<&BoneChannel> {
        self.name_to_bone.get(name).map(|&i| &self.bone_channels[i])
    }

    /// 按名称找表情通道
    #[inline]
    pub fn face_channel(&self, name: &str) -> Option<&FaceChannel> {
        self.name_to_face.get(name).map(|&i| &self.face_channels[i])
    }

    /// 全轨道最大帧号
    #[inline]
    pub fn max_frame(&self) -> f32 {
        self.max_frame
    }
}

/// 带缓存的关键帧对定位
///
/// 帧区间大多单调推进，从上次命中的位置继续向后扫；
/// 回绕（循环）时从头重扫到上次位置。返回 (k1, k2)，调用方
/// 负责把 k1 存回缓存。`frame` 须已被夹到末关键帧以内。
pub(crate) fn locate_keys<T>(keys: &[T], frame_of: impl Fn(&T) -> f32, frame: f32, last_key: usize) -> (usize, usize) {
    let n = keys.len();
    let mut k2 = 0;
    if last_key < n && frame >= frame_of(&keys[last_key]) {
        for i in last_key..n {
            if frame <= frame_of(&keys[i]) {
                k2 = i;
                break;
            }
        }
    } else {
        for i in 0..n.min(last_key + 1) {
            if frame <= frame_of(&keys[i]) {
                k2 = i;
                break;
            }
        }
    }
    if k2 >= n {
        k2 = n - 1;
    }
    let k1 = if k2 <= 1 { 0 } else { k2 - 1 };
    (k1, k2)
}

// ============================================================================
// 装配器
// ============================================================================

/// 动作装配器（加载器逐帧喂入，`build` 时校验帧序并定最大帧号）
pub struct MotionClipBuilder {
    cache: EaseCache,
    bone_channels: Vec<BoneChannel>,
    face_channels: Vec<FaceChannel>,
    camera: Vec<CameraKeyframe>,
    switches: Vec<SwitchKeyframe>,
    name_to_bone: HashMap<String, usize>,
    name_to_face: HashMap<String, usize>,
}

impl MotionClipBuilder {
    pub fn new() -> Self {
        Self {
            cache: EaseCache::new(),
            bone_channels: Vec::new(),
            face_channels: Vec::new(),
            camera: Vec::new(),
            switches: Vec::new(),
            name_to_bone: HashMap::new(),
            name_to_face: HashMap::new(),
        }
    }

    /// 追加骨骼关键帧，子通道插值按 [x, y, z, 旋转] 给出
    pub fn bone_keyframe(
        &mut self,
        name: &str,
        frame: f32,
        pos: Vec3,
        rot: Quat,
        curves: [CurveSpec; 4],
    ) -> &mut Self {
        let interp = curves.map(|c| Interp::from_spec(c, &self.cache));
        let idx = match self.name_to_bone.get(name) {
            Some(&i) => i,
            None => {
                let i = self.bone_channels.len();
                self.bone_channels.push(BoneChannel {
                    name: name.to_string(),
                    keyframes: Vec::new(),
                });
                self.name_to_bone.insert(name.to_string(), i);
                i
            }
        };
        self.bone_channels[idx]
            .keyframes
            .push(BoneKeyframe { frame, pos, rot, interp });
        self
    }

    /// 追加线性插值的骨骼关键帧
    pub fn bone_keyframe_linear(&mut self, name: &str, frame: f32, pos: Vec3, rot: Quat) -> &mut Self {
        self.bone_keyframe(name, frame, pos, rot, [CurveSpec::LINEAR; 4])
    }

    /// 追加表情关键帧
    pub fn face_keyframe(&mut self, name: &str, frame: f32, weight: f32) -> &mut Self {
        let idx = match self.name_to_face.get(name) {
            Some(&i) => i,
            None => {
                let i = self.face_channels.len();
                self.face_channels.push(FaceChannel {
                    name: name.to_string(),
                    keyframes: Vec::new(),
                });
                self.name_to_face.insert(name.to_string(), i);
                i
            }
        };
        self.face_channels[idx]
            .keyframes
            .push(FaceKeyframe { frame, weight });
        self
    }

    /// 追加相机关键帧
    pub fn camera_keyframe(
        &mut self,
        frame: f32,
        distance: f32,
        pos: Vec3,
        angle: Vec3,
        fovy: f32,
        curves: [CurveSpec; 6],
    ) -> &mut Self {
        let interp = curves.map(|c| Interp::from_spec(c, &self.cache));
        self.camera.push(CameraKeyframe {
            frame,
            distance,
            pos,
            angle,
            fovy,
            interp,
        });
        self
    }

    /// 追加开关关键帧
    pub fn switch_keyframe(
        &mut self,
        frame: f32,
        display: bool,
        ik_enable: Vec<(String, bool)>,
    ) -> &mut Self {
        self.switches.push(SwitchKeyframe {
            frame,
            display,
            ik_enable,
        });
        self
    }

    /// 校验帧序并产出不可变动作
    pub fn build(self) -> Result<MotionClip> {
        fn check_order<T>(channel: &str, keys: &[T], frame_of: impl Fn(&T) -> f32) -> Result<()> {
            for pair in keys.windows(2) {
                if frame_of(&pair[1]) < frame_of(&pair[0]) {
                    return Err(MmdError::KeyframeOrder {
                        channel: channel.to_string(),
                        frame: frame_of(&pair[1]),
                    });
                }
            }
            Ok(())
        }

        let mut max_frame = 0.0_f32;
        for ch in &self.bone_channels {
            check_order(&ch.name, &ch.keyframes, |k| k.frame)?;
            if let Some(last) = ch.keyframes.last() {
                max_frame = max_frame.max(last.frame);
            }
        }
        for ch in &self.face_channels {
            check_order(&ch.name, &ch.keyframes, |k| k.frame)?;
            if let Some(last) = ch.keyframes.last() {
                max_frame = max_frame.max(last.frame);
            }
        }
        check_order("camera", &self.camera, |k| k.frame)?;
        if let Some(last) = self.camera.last() {
            max_frame = max_frame.max(last.frame);
        }
        check_order("switch", &self.switches, |k| k.frame)?;
        if let Some(last) = self.switches.last() {
            max_frame = max_frame.max(last.frame);
        }

        Ok(MotionClip {
            bone_channels: self.bone_channels,
            face_channels: self.face_channels,
            camera: self.camera,
            switches: self.switches,
            name_to_bone: self.name_to_bone,
            name_to_face: self.name_to_face,
            max_frame,
        })
    }
}

impl Default for MotionClipBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_frame_spans_all_channels() {
        let mut b = MotionClipBuilder::new();
        b.bone_keyframe_linear("arm", 0.0, Vec3::ZERO, Quat::IDENTITY)
            .bone_keyframe_linear("arm", 30.0, Vec3::X, Quat::IDENTITY)
            .face_keyframe("smile", 45.0, 1.0);
        let clip = b.build().unwrap();
        assert_eq!(clip.max_frame(), 45.0);
    }

    #[test]
    fn decreasing_frames_rejected() {
        let mut b = MotionClipBuilder::new();
        b.bone_keyframe_linear("arm", 30.0, Vec3::ZERO, Quat::IDENTITY)
            .bone_keyframe_linear("arm", 10.0, Vec3::X, Quat::IDENTITY);
        assert!(matches!(b.build(), Err(MmdError::KeyframeOrder { .. })));
    }

    #[test]
    fn equal_frames_allowed() {
        let mut b = MotionClipBuilder::new();
        b.face_keyframe("a", 5.0, 0.0).face_keyframe("a", 5.0, 1.0);
        assert!(b.build().is_ok());
    }

    #[test]
    fn channel_lookup_by_name() {
        let mut b = MotionClipBuilder::new();
        b.bone_keyframe_linear("arm", 0.0, Vec3::ZERO, Quat::IDENTITY);
        let clip = b.build().unwrap();
        assert!(clip.bone_channel("arm").is_some());
        assert!(clip.bone_channel("leg").is_none());
    }

    #[test]
    fn locate_keys_resumes_from_cache() {
        let keys = [0.0_f32, 10.0, 20.0, 30.0];
        let (k1, k2) = locate_keys(&keys, |&k| k, 15.0, 0);
        assert_eq!((k1, k2), (1, 2));
        // 从缓存位置继续
        let (k1, k2) = locate_keys(&keys, |&k| k, 25.0, k1);
        assert_eq!((k1, k2), (2, 3));
        // 回绕后重扫
        let (k1, k2) = locate_keys(&keys, |&k| k, 5.0, k1);
        assert_eq!((k1, k2), (0, 1));
    }

    #[test]
    fn locate_keys_exact_hit_picks_key_as_upper() {
        let keys = [0.0_f32, 10.0, 20.0];
        let (k1, k2) = locate_keys(&keys, |&k| k, 10.0, 0);
        assert_eq!((k1, k2), (0, 1));
    }
}
