//! 单轨动作播放
//!
//! 把一段 MotionClip 绑定到一个模型实例：推进时钟、按缓动求值各通道、
//! 以 replace/add/mul 模式写入骨骼与 Morph 权重，并在动作开始与循环处
//! 用姿态快照做平滑过渡（避免从当前姿态跳变到第一帧）。

use std::sync::Arc;

use glam::{Quat, Vec3};

use crate::config::EngineConfig;
use crate::morph::MorphManager;
use crate::skeleton::BoneSet;

use super::clip::{locate_keys, BoneChannel, FaceChannel, MotionClip};

// ============================================================================
// 应用模式
// ============================================================================

/// 通道应用模式（按通道配置，而非按关键帧）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyMode {
    /// 覆盖当前值
    Replace,
    /// 叠加到其它轨道已写入的值之上
    Add,
    /// 乘算（仅表情权重有意义）
    Mul,
    /// 忽略该通道
    None,
}

/// 通道配置指令
#[derive(Clone, Debug)]
pub enum MotionConfigure {
    /// 设置全部通道的应用率
    BlendRate(f32),
    /// 全部通道置为覆盖模式，可顺带设应用率
    ReplaceAll { rate: Option<f32> },
    /// 全部通道置为叠加模式
    AddAll { rate: Option<f32> },
    /// 骨骼通道置覆盖、表情通道置乘算
    MulFaces { rate: Option<f32> },
    /// 指定名称的骨骼通道改模式
    Bones { names: Vec<String>, mode: ApplyMode },
    /// 指定名称的表情通道改模式
    Faces { names: Vec<String>, mode: ApplyMode },
}

// ============================================================================
// 通道元素
// ============================================================================

/// 骨骼通道播放状态
struct BoneControl {
    /// 骨骼索引（BoneSet 内）
    bone: usize,
    /// 通道索引（clip 内）
    channel: usize,
    /// 本帧求值结果
    pos: Vec3,
    rot: Quat,
    /// 动作开始时的姿态快照
    snap_pos: Vec3,
    snap_rot: Quat,
    /// 上次命中的关键帧缓存
    last_key: usize,
    /// 回绕后首帧用末帧值替换
    looped: bool,
    mode: ApplyMode,
    rate: f32,
}

/// 表情通道播放状态
struct FaceControl {
    morph: usize,
    channel: usize,
    weight: f32,
    snap_weight: f32,
    last_key: usize,
    looped: bool,
    mode: ApplyMode,
    rate: f32,
}

struct SwitchControl {
    last_key: usize,
}

// ============================================================================
// 控制器
// ============================================================================

/// 单轨动作控制器
pub struct MotionController {
    clip: Arc<MotionClip>,
    bone_ctrl: Vec<BoneControl>,
    face_ctrl: Vec<FaceControl>,
    switch_ctrl: Option<SwitchControl>,

    max_frame: f32,
    current_frame: f64,
    previous_frame: f64,

    /// 起始平滑剩余帧数（骨骼/表情各一份，随推进递减到零）
    no_bone_smear: f64,
    no_face_smear: f64,
    bone_blend_rate: f32,
    face_blend_rate: f32,

    /// 只有一个关键帧的通道按静态忽略
    ignore_single_motion: bool,
    /// 已做过姿态快照，起始与循环处做平滑
    override_first: bool,
    has_center_bone_motion: bool,

    bone_start_margin: f32,
    face_start_margin: f32,
}

impl MotionController {
    /// 绑定动作到模型：按名称解析各通道，缺失的名称丢弃该通道
    pub fn new(
        clip: Arc<MotionClip>,
        bones: &BoneSet,
        morphs: &MorphManager,
        config: &EngineConfig,
    ) -> Self {
        let mut bone_ctrl = Vec::new();
        let mut has_center_bone_motion = false;
        for (i, channel) in clip.bone_channels().iter().enumerate() {
            if channel.keyframes.is_empty() {
                continue;
            }
            match bones.find(&channel.name) {
                Some(bone) => {
                    bone_ctrl.push(BoneControl {
                        bone,
                        channel: i,
                        pos: Vec3::ZERO,
                        rot: Quat::IDENTITY,
                        snap_pos: Vec3::ZERO,
                        snap_rot: Quat::IDENTITY,
                        last_key: 0,
                        looped: false,
                        mode: ApplyMode::Replace,
                        rate: 1.0,
                    });
                    if channel.keyframes.len() > 1 && channel.name == config.center_bone_name {
                        has_center_bone_motion = true;
                    }
                }
                None => {
                    log::warn!("[motion] bone channel '{}' not in model, dropped", channel.name);
                }
            }
        }

        let mut face_ctrl = Vec::new();
        for (i, channel) in clip.face_channels().iter().enumerate() {
            if channel.keyframes.is_empty() {
                continue;
            }
            match morphs.find(&channel.name) {
                Some(morph) => face_ctrl.push(FaceControl {
                    morph,
                    channel: i,
                    weight: 0.0,
                    snap_weight: 0.0,
                    last_key: 0,
                    looped: false,
                    mode: ApplyMode::Replace,
                    rate: 1.0,
                }),
                None => {
                    log::warn!("[motion] face channel '{}' not in model, dropped", channel.name);
                }
            }
        }

        let switch_ctrl = if clip.switch_keyframes().is_empty() {
            None
        } else {
            Some(SwitchControl { last_key: 0 })
        };

        let max_frame = clip.max_frame();
        Self {
            clip,
            bone_ctrl,
            face_ctrl,
            switch_ctrl,
            max_frame,
            current_frame: 0.0,
            previous_frame: 0.0,
            no_bone_smear: 0.0,
            no_face_smear: 0.0,
            bone_blend_rate: 1.0,
            face_blend_rate: 1.0,
            ignore_single_motion: false,
            override_first: false,
            has_center_bone_motion,
            bone_start_margin: config.bone_start_margin,
            face_start_margin: config.face_start_margin,
        }
    }

    // ========================================
    // 求值
    // ========================================

    /// 求骨骼通道在指定帧的位移与旋转
    fn calc_bone_at(
        channel: &BoneChannel,
        elem: &mut BoneControl,
        frame_now: f32,
        override_first: bool,
        no_bone_smear: f32,
        bone_start_margin: f32,
    ) {
        let keys = &channel.keyframes;
        let n = keys.len();
        let frame = frame_now.min(keys[n - 1].frame);

        let (k1, k2) = locate_keys(keys, |k| k.frame, frame, elem.last_key);
        elem.last_key = k1;

        let time1 = keys[k1].frame;
        let time2 = keys[k2].frame;
        let mut pos1 = keys[k1].pos;
        let mut rot1 = keys[k1].rot;
        let mut pos2 = keys[k2].pos;
        let mut rot2 = keys[k2].rot;
        let interp = &keys[k2].interp;

        if override_first && elem.looped {
            // 回绕后的首帧用末帧值顶替，保证循环接缝连续
            if k1 == 0 || time1 == 0.0 {
                pos1 = keys[n - 1].pos;
                rot1 = keys[n - 1].rot;
            }
            if k2 == 0 || time2 == 0.0 {
                pos2 = keys[n - 1].pos;
                rot2 = keys[n - 1].rot;
            }
        }

        if time1 != time2 {
            if frame <= time1 {
                elem.pos = pos1;
                elem.rot = rot1;
            } else if frame >= time2 {
                elem.pos = pos2;
                elem.rot = rot2;
            } else {
                let w = (frame - time1) / (time2 - time1);
                let wx = interp[0].apply(w);
                let wy = interp[1].apply(w);
                let wz = interp[2].apply(w);
                elem.pos = Vec3::new(
                    pos1.x * (1.0 - wx) + pos2.x * wx,
                    pos1.y * (1.0 - wy) + pos2.y * wy,
                    pos1.z * (1.0 - wz) + pos2.z * wz,
                );
                let wr = interp[3].apply(w);
                elem.rot = rot1.slerp(rot2, wr);
            }
        } else {
            // 同帧号的退化键对，直接取前一个
            elem.pos = pos1;
            elem.rot = rot1;
        }

        if override_first && no_bone_smear > 0.0 && elem.mode == ApplyMode::Replace {
            // 与动作开始时的快照做线性收缩混合
            let w = no_bone_smear / bone_start_margin;
            elem.pos = elem.pos.lerp(elem.snap_pos, w);
            elem.rot = elem.rot.slerp(elem.snap_rot, w);
        }
    }

    /// 求表情通道在指定帧的权重
    fn calc_face_at(
        channel: &FaceChannel,
        elem: &mut FaceControl,
        frame_now: f32,
        override_first: bool,
        no_face_smear: f32,
        face_start_margin: f32,
    ) {
        let keys = &channel.keyframes;
        let n = keys.len();
        let frame = frame_now.min(keys[n - 1].frame);

        let (k1, k2) = locate_keys(keys, |k| k.frame, frame, elem.last_key);
        elem.last_key = k1;

        let time1 = keys[k1].frame;
        let time2 = keys[k2].frame;
        let mut weight1 = keys[k1].weight;
        let mut weight2 = keys[k2].weight;

        if override_first && elem.looped {
            if k1 == 0 || time1 == 0.0 {
                weight1 = keys[n - 1].weight;
            }
            if k2 == 0 || time2 == 0.0 {
                weight2 = keys[n - 1].weight;
            }
        }

        if time1 != time2 {
            let w = (frame - time1) / (time2 - time1);
            if time2 - time1 <= 1.0
                && ((weight1 == 0.0 && weight2 == 1.0) || (weight1 == 1.0 && weight2 == 0.0))
            {
                // 相邻帧 0↔1 的瞬时切换不插值，取中点前后各自的值
                elem.weight = if w <= 0.5 { weight1 } else { weight2 };
            } else {
                elem.weight = weight1 * (1.0 - w) + weight2 * w;
            }
        } else {
            elem.weight = weight1;
        }

        if override_first && no_face_smear > 0.0 {
            // 起始平滑窗口取第二个关键帧之前的区间，上限为配置的边距
            let mut smear_frame = face_start_margin;
            if n > 1 {
                smear_frame = keys[1].frame.min(face_start_margin);
            }
            if smear_frame > 1.0 {
                let cur = face_start_margin - no_face_smear;
                if cur < smear_frame {
                    let w = cur / smear_frame;
                    elem.weight = elem.weight * w + elem.snap_weight * (1.0 - w);
                }
            }
        }
    }

    /// 把当前帧的动作值写入骨骼与 Morph 权重，返回开关轨道的显示标志
    pub fn control(
        &mut self,
        frame_now: f32,
        bones: &mut BoneSet,
        morphs: &mut MorphManager,
    ) -> Option<bool> {
        let clip = self.clip.clone();

        for elem in &mut self.bone_ctrl {
            let channel = &clip.bone_channels()[elem.channel];
            if self.ignore_single_motion && channel.keyframes.len() <= 1 {
                // 静态通道被忽略，但起始平滑期间仍向快照收敛
                if self.override_first && self.no_bone_smear > 0.0 {
                    let w = (self.no_bone_smear as f32) / self.bone_start_margin;
                    let bone = bones.bone_mut(elem.bone);
                    bone.pos = bone.pos.lerp(elem.snap_pos, w);
                    bone.rot = bone.rot.slerp(elem.snap_rot, w);
                }
                continue;
            }

            Self::calc_bone_at(
                channel,
                elem,
                frame_now,
                self.override_first,
                self.no_bone_smear as f32,
                self.bone_start_margin,
            );
            if elem.rate != 1.0 {
                elem.pos *= elem.rate;
                elem.rot = Quat::IDENTITY.slerp(elem.rot, elem.rate);
            }

            let rate = self.bone_blend_rate;
            let bone = bones.bone_mut(elem.bone);
            match elem.mode {
                ApplyMode::Replace => {
                    if rate == 1.0 {
                        bone.pos = elem.pos;
                        bone.rot = elem.rot;
                    } else {
                        bone.pos = bone.pos.lerp(elem.pos, rate);
                        bone.rot = bone.rot.slerp(elem.rot, rate);
                    }
                }
                ApplyMode::Add => {
                    if rate == 1.0 {
                        bone.pos += elem.pos;
                        bone.rot = elem.rot * bone.rot;
                    } else {
                        bone.pos += elem.pos * rate;
                        bone.rot = Quat::IDENTITY.slerp(elem.rot, rate) * bone.rot;
                    }
                }
                ApplyMode::Mul | ApplyMode::None => {}
            }
        }

        for elem in &mut self.face_ctrl {
            let channel = &clip.face_channels()[elem.channel];
            if self.ignore_single_motion && channel.keyframes.len() <= 1 {
                continue;
            }
            Self::calc_face_at(
                channel,
                elem,
                frame_now,
                self.override_first,
                self.no_face_smear as f32,
                self.face_start_margin,
            );
            if elem.rate != 1.0 {
                elem.weight *= elem.rate;
            }

            let rate = self.face_blend_rate;
            let current = morphs.weight(elem.morph);
            match elem.mode {
                ApplyMode::Replace => {
                    let w = if rate == 1.0 {
                        elem.weight
                    } else {
                        current * (1.0 - rate) + elem.weight * rate
                    };
                    morphs.set_weight(elem.morph, w);
                }
                ApplyMode::Add => {
                    morphs.set_weight(elem.morph, current + elem.weight * rate);
                }
                ApplyMode::Mul => {
                    morphs.set_weight(elem.morph, current + (1.0 - current) * elem.weight * rate);
                }
                ApplyMode::None => {}
            }
        }

        let mut display = None;
        if let Some(sw) = &mut self.switch_ctrl {
            let keys = clip.switch_keyframes();
            if !(self.ignore_single_motion && keys.len() <= 1) {
                let frame = frame_now.min(keys[keys.len() - 1].frame);
                let (k1, k2) = locate_keys(keys, |k| k.frame, frame, sw.last_key);
                sw.last_key = k1;
                let current = if keys[k1].frame != keys[k2].frame && keys[k2].frame == frame {
                    &keys[k2]
                } else {
                    &keys[k1]
                };
                display = Some(current.display);
                for (name, enable) in &current.ik_enable {
                    bones.set_ik_switch_by_name(name, *enable);
                }
            }
        }
        display
    }

    // ========================================
    // 时钟
    // ========================================

    /// 推进指定帧数：先把当前帧应用到模型，再前进时钟。
    /// 到达末帧时返回 true（时钟夹在末帧）。
    pub fn advance(
        &mut self,
        delta_frame: f64,
        bones: &mut BoneSet,
        morphs: &mut MorphManager,
    ) -> (bool, Option<bool>) {
        if self.bone_ctrl.is_empty() && self.face_ctrl.is_empty() && self.switch_ctrl.is_none() {
            return (false, None);
        }

        let display = self.control(self.current_frame as f32, bones, morphs);

        if self.no_bone_smear > 0.0 {
            self.no_bone_smear = (self.no_bone_smear - delta_frame).max(0.0);
        }
        if self.no_face_smear > 0.0 {
            self.no_face_smear = (self.no_face_smear - delta_frame).max(0.0);
        }

        self.previous_frame = self.current_frame;
        self.current_frame += delta_frame;
        if self.current_frame >= self.max_frame as f64 {
            self.current_frame = self.max_frame as f64;
            return (true, display);
        }
        (false, display)
    }

    /// 回绕到指定帧，保留越过末帧的溢出量
    pub fn rewind(&mut self, target_frame: f32, frame: f64) {
        self.current_frame = self.previous_frame + frame - self.max_frame as f64 + target_frame as f64;
        self.previous_frame = target_frame as f64;
        if self.override_first {
            self.set_looped_flags(true);
        }
    }

    /// 动作启动时调用：对当前姿态做快照，之后的起始平滑从快照过渡到动作。
    /// `center_offset` 给出时，运动独立骨骼的快照扣除该偏移（中心重定位）。
    pub fn set_override_first(
        &mut self,
        center_offset: Option<Vec3>,
        bones: &BoneSet,
        morphs: &MorphManager,
    ) {
        self.take_snap(center_offset, bones, morphs);
        self.set_looped_flags(false);
        self.override_first = true;
        self.no_bone_smear = self.bone_start_margin as f64;
        self.no_face_smear = self.face_start_margin as f64;
    }

    fn take_snap(&mut self, center_offset: Option<Vec3>, bones: &BoneSet, morphs: &MorphManager) {
        for elem in &mut self.bone_ctrl {
            let bone = bones.bone(elem.bone);
            elem.snap_pos = bone.pos;
            if let Some(offset) = center_offset {
                if bone.motion_independent() {
                    elem.snap_pos -= offset;
                }
            }
            elem.snap_rot = bone.rot;
        }
        for elem in &mut self.face_ctrl {
            elem.snap_weight = morphs.weight(elem.morph);
        }
    }

    fn set_looped_flags(&mut self, flag: bool) {
        for elem in &mut self.bone_ctrl {
            elem.looped = flag;
        }
        for elem in &mut self.face_ctrl {
            elem.looped = flag;
        }
    }

    /// 重置播放状态（不动通道绑定）
    pub fn reset(&mut self) {
        for elem in &mut self.bone_ctrl {
            elem.last_key = 0;
        }
        for elem in &mut self.face_ctrl {
            elem.last_key = 0;
        }
        if let Some(sw) = &mut self.switch_ctrl {
            sw.last_key = 0;
        }
        self.current_frame = 0.0;
        self.previous_frame = 0.0;
        self.no_bone_smear = 0.0;
        self.no_face_smear = 0.0;
        self.bone_blend_rate = 1.0;
        self.face_blend_rate = 1.0;
        self.ignore_single_motion = false;
        self.override_first = false;
        self.set_looped_flags(false);
    }

    // ========================================
    // 配置
    // ========================================

    /// 设置全部通道的应用率
    pub fn set_op_rate(&mut self, rate: f32) {
        for elem in &mut self.bone_ctrl {
            elem.rate = rate;
        }
        for elem in &mut self.face_ctrl {
            elem.rate = rate;
        }
    }

    /// 调整通道应用方式，返回是否有通道被命中
    pub fn configure(&mut self, cfg: &MotionConfigure) -> bool {
        match cfg {
            MotionConfigure::BlendRate(rate) => {
                self.set_op_rate(*rate);
                true
            }
            MotionConfigure::ReplaceAll { rate } => {
                if let Some(r) = rate {
                    self.set_op_rate(*r);
                }
                for elem in &mut self.bone_ctrl {
                    elem.mode = ApplyMode::Replace;
                }
                for elem in &mut self.face_ctrl {
                    elem.mode = ApplyMode::Replace;
                }
                true
            }
            MotionConfigure::AddAll { rate } => {
                if let Some(r) = rate {
                    self.set_op_rate(*r);
                }
                for elem in &mut self.bone_ctrl {
                    elem.mode = ApplyMode::Add;
                }
                for elem in &mut self.face_ctrl {
                    elem.mode = ApplyMode::Add;
                }
                true
            }
            MotionConfigure::MulFaces { rate } => {
                if let Some(r) = rate {
                    self.set_op_rate(*r);
                }
                for elem in &mut self.bone_ctrl {
                    elem.mode = ApplyMode::Replace;
                }
                for elem in &mut self.face_ctrl {
                    elem.mode = ApplyMode::Mul;
                }
                true
            }
            MotionConfigure::Bones { names, mode } => {
                let mut found = false;
                for elem in &mut self.bone_ctrl {
                    let name = &self.clip.bone_channels()[elem.channel].name;
                    if names.iter().any(|n| n == name) {
                        elem.mode = *mode;
                        found = true;
                    }
                }
                found
            }
            MotionConfigure::Faces { names, mode } => {
                let mut found = false;
                for elem in &mut self.face_ctrl {
                    let name = &self.clip.face_channels()[elem.channel].name;
                    if names.iter().any(|n| n == name) {
                        elem.mode = *mode;
                        found = true;
                    }
                }
                found
            }
        }
    }

    // ========================================
    // 访问器
    // ========================================

    /// 末帧号
    #[inline]
    pub fn max_frame(&self) -> f32 {
        self.max_frame
    }

    /// 当前帧
    #[inline]
    pub fn current_frame(&self) -> f64 {
        self.current_frame
    }

    /// 写当前帧（换装动作时保持时钟用）
    #[inline]
    pub fn set_current_frame(&mut self, frame: f64) {
        self.current_frame = frame;
    }

    /// 上一帧
    #[inline]
    pub fn previous_frame(&self) -> f64 {
        self.previous_frame
    }

    /// 写上一帧
    #[inline]
    pub fn set_previous_frame(&mut self, frame: f64) {
        self.previous_frame = frame;
    }

    /// 动作是否带多于一帧的中心骨骼通道（决定是否可做中心重定位）
    #[inline]
    pub fn has_center(&self) -> bool {
        self.has_center_bone_motion
    }

    /// 骨骼混合率（淡出期间由管理器按剩余帧设置）
    #[inline]
    pub fn set_bone_blend_rate(&mut self, rate: f32) {
        self.bone_blend_rate = rate;
    }

    /// 表情混合率
    #[inline]
    pub fn set_face_blend_rate(&mut self, rate: f32) {
        self.face_blend_rate = rate;
    }

    /// 设置是否忽略单帧静态通道
    #[inline]
    pub fn set_ignore_single_motion(&mut self, flag: bool) {
        self.ignore_single_motion = flag;
    }

    /// 播放的动作数据
    #[inline]
    pub fn clip(&self) -> &Arc<MotionClip> {
        &self.clip
    }
}
