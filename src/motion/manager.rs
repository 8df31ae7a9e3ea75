//! 多轨动作管理
//!
//! 每个角色持有一组并发的动作播放器（按逻辑名寻址），处理
//! 启动/停止/换装/优先级/变速，并在每帧推进后清理播完的播放器。
//!
//! 播放器保存在按优先级升序排序的 Vec 里：更新按列表顺序执行，
//! 后应用者覆盖先应用者，因此高优先级的 replace 确定性地获胜。
//! 删除采用"标记 + 更新尾部紧缩"，不在遍历中摘除元素。

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::morph::MorphManager;
use crate::skeleton::BoneSet;

use super::clip::MotionClip;
use super::controller::{MotionConfigure, MotionController};

// ============================================================================
// 播放器状态
// ============================================================================

/// 动作播完后的行为
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndBehavior {
    /// 保持最后姿态
    HoldLastPose,
    /// 回绕到 loop_at 继续
    Loop,
    /// 淡出后移除
    Disappear,
}

/// 播放器在一次 update 内的状态变化
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MotionStatus {
    /// 正常推进
    Running,
    /// 本次 update 刚刚回绕
    Looped,
    /// 本次 update 播完或被删除
    Deleted,
}

/// 变速状态机
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AccelStatus {
    /// 匀速
    Constant,
    /// 等待变速起始帧
    Waiting,
    /// 变速中
    Changing,
    /// 刚到达目标速度
    Ended,
}

/// 单个动作播放器
pub struct MotionPlayer {
    name: String,
    controller: MotionController,
    clip: Arc<MotionClip>,

    // 启动前设定的开关
    on_end: EndBehavior,
    priority: f32,
    /// 单帧静态通道按忽略处理（partial 启动）
    ignore_static: bool,
    loop_at: f32,
    enable_smooth: bool,
    enable_repos: bool,
    ending_bone_blend_frames: f32,
    ending_face_blend_frames: f32,
    motion_blend_rate: f32,

    // 工作区
    active: bool,
    /// 淡出剩余帧数（非零表示处于淡出状态）
    ending_bone_blend: f32,
    ending_face_blend: f32,
    status: MotionStatus,

    target_speed_rate: f32,
    current_speed_rate: f32,
    remaining_frames_for_start_of_accel: f32,
    remaining_frames_for_end_of_accel: f32,
    accel_status: AccelStatus,
    want_delete: bool,
}

impl MotionPlayer {
    /// 逻辑名
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 优先级
    #[inline]
    pub fn priority(&self) -> f32 {
        self.priority
    }

    /// 本次 update 的状态
    #[inline]
    pub fn status(&self) -> MotionStatus {
        self.status
    }

    /// 当前速度倍率
    #[inline]
    pub fn current_speed_rate(&self) -> f32 {
        self.current_speed_rate
    }

    /// 播完后的行为
    #[inline]
    pub fn end_behavior(&self) -> EndBehavior {
        self.on_end
    }

    /// 是否处于淡出状态
    #[inline]
    pub fn is_ending(&self) -> bool {
        self.ending_bone_blend != 0.0 || self.ending_face_blend != 0.0
    }

    /// 控制器
    #[inline]
    pub fn controller(&self) -> &MotionController {
        &self.controller
    }

    /// 可变控制器
    #[inline]
    pub fn controller_mut(&mut self) -> &mut MotionController {
        &mut self.controller
    }
}

// ============================================================================
// 管理器
// ============================================================================

/// 多轨动作管理器
pub struct MotionManager {
    config: EngineConfig,
    players: Vec<MotionPlayer>,
    /// full 启动后，未被基础动作控制的骨骼/表情在此帧数内归位
    beginning_non_controlled_blend: f32,
    /// 本次 update 中开关轨道要求的显示状态（后写者胜）
    display_request: Option<bool>,
}

impl MotionManager {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            players: Vec::new(),
            beginning_non_controlled_blend: 0.0,
            display_request: None,
        }
    }

    // ========================================
    // 启动 / 换装 / 删除
    // ========================================

    /// 启动一个动作
    ///
    /// 同名播放器若处于淡出状态会被立即终止（允许顶替）。
    /// `full` 启动把未被控制的骨骼/表情在配置的窗口内重置回中立姿态；
    /// `once` 播完淡出消失，否则循环；`repos` 启动时把模型根
    /// 平移到中心骨骼当前位置（带中心通道的动作才生效）。
    #[allow(clippy::too_many_arguments)]
    pub fn start_motion(
        &mut self,
        bones: &mut BoneSet,
        morphs: &MorphManager,
        clip: Arc<MotionClip>,
        name: &str,
        full: bool,
        once: bool,
        smooth: bool,
        repos: bool,
        priority: f32,
    ) -> bool {
        self.terminate_ending_motion(name);
        self.purge_inactive();

        let mut player = MotionPlayer {
            name: name.to_string(),
            controller: MotionController::new(clip.clone(), bones, morphs, &self.config),
            clip,
            on_end: if once { EndBehavior::Disappear } else { EndBehavior::Loop },
            priority,
            ignore_static: !full,
            loop_at: self.config.default_loop_at,
            enable_smooth: smooth,
            enable_repos: repos,
            ending_bone_blend_frames: self.config.bone_end_margin,
            ending_face_blend_frames: self.config.face_end_margin,
            motion_blend_rate: 1.0,
            active: true,
            ending_bone_blend: 0.0,
            ending_face_blend: 0.0,
            status: MotionStatus::Running,
            target_speed_rate: 1.0,
            current_speed_rate: 1.0,
            remaining_frames_for_start_of_accel: -1.0,
            remaining_frames_for_end_of_accel: -1.0,
            accel_status: AccelStatus::Constant,
            want_delete: false,
        };

        self.start_motion_sub(&mut player, bones, morphs);

        if !player.ignore_static {
            self.beginning_non_controlled_blend = self.config.non_controlled_reset_frames;
        }

        // 按优先级插入：列表升序，越靠后越后应用（即覆盖前者）。
        // 头部是基础动作，只有严格更高优先级才会排到它前面。
        let pos = if self.players.is_empty() || self.players[0].priority > player.priority {
            0
        } else {
            let mut insert_at = self.players.len();
            for i in 1..self.players.len() {
                if self.players[i].priority > player.priority {
                    insert_at = i;
                    break;
                }
            }
            insert_at
        };
        self.players.insert(pos, player);
        log::debug!("[motion] started '{name}'");
        true
    }

    /// 换装：替换同名播放器的动作数据，保留优先级等配置
    pub fn swap_motion(
        &mut self,
        bones: &mut BoneSet,
        morphs: &MorphManager,
        clip: Arc<MotionClip>,
        name: &str,
    ) -> bool {
        self.purge_inactive();

        let Some(idx) = self.players.iter().position(|p| p.name == name) else {
            return false;
        };
        let mut player = self.players.remove(idx);
        player.clip = clip.clone();
        player.controller = MotionController::new(clip, bones, morphs, &self.config);
        self.start_motion_sub(&mut player, bones, morphs);
        let ignore_static = player.ignore_static;
        self.players.insert(idx, player);

        if !ignore_static {
            self.beginning_non_controlled_blend = self.config.non_controlled_reset_frames;
        }
        log::debug!("[motion] swapped '{name}'");
        true
    }

    /// 播放器公共初始化（启动与换装共用）
    fn start_motion_sub(&mut self, player: &mut MotionPlayer, bones: &mut BoneSet, morphs: &MorphManager) {
        player.controller.reset();
        player.controller.set_ignore_single_motion(player.ignore_static);

        player.active = true;
        player.ending_bone_blend = 0.0;
        player.ending_face_blend = 0.0;
        // 动作更换时关闭进行中的变速
        player.accel_status = AccelStatus::Constant;
        player.want_delete = false;

        if player.enable_smooth {
            let repos_offset = if player.controller.has_center() && player.enable_repos {
                Self::relocate_root_to_center(bones)
            } else {
                None
            };
            player.controller.set_override_first(repos_offset, bones, morphs);
        }
    }

    /// 中心重定位：把模型根骨骼的偏移移到中心骨骼当前位置（Y 归零），
    /// 返回传给快照的中心偏移
    fn relocate_root_to_center(bones: &mut BoneSet) -> Option<glam::Vec3> {
        let root = bones.root_bone()?;
        let center = bones.center_bone()?;

        let inv_root = bones.bone(root).trans.inverse();
        let pos = inv_root.transform_point3(bones.bone(center).world_position());
        let mut offset = pos - bones.bone(center).origin_position;
        // 模型要贴地，Y 不动
        offset.y = 0.0;

        bones.bone_mut(root).offset += offset;
        bones.update_at(root);
        Some(offset)
    }

    /// 标记删除：淡出走完后在 update 尾部被移除
    pub fn delete_motion(&mut self, name: &str) -> bool {
        for player in &mut self.players {
            if player.active && player.name == name {
                player.want_delete = true;
                return true;
            }
        }
        false
    }

    /// 调整指定动作的通道应用方式
    pub fn configure_motion(&mut self, name: &str, cfg: &MotionConfigure) -> bool {
        for player in &mut self.players {
            if player.active && player.name == name {
                return player.controller.configure(cfg);
            }
        }
        false
    }

    /// 设定目标速度倍率
    ///
    /// `change_length` 帧内线性过渡；`target_frame` 给出时从该帧开始过渡
    /// （早于当前帧按下一圈计）。
    pub fn set_motion_speed_rate(
        &mut self,
        name: &str,
        speed_rate: f32,
        change_length: f32,
        target_frame: Option<f32>,
    ) -> bool {
        if speed_rate < 0.0 || change_length < 0.0 {
            return false;
        }
        for player in &mut self.players {
            if player.active && player.name == name {
                player.target_speed_rate = speed_rate;
                match target_frame {
                    None => {
                        player.remaining_frames_for_start_of_accel = 0.0;
                        player.remaining_frames_for_end_of_accel = change_length;
                    }
                    Some(frame) => {
                        let mut start = frame - player.controller.current_frame() as f32;
                        if start < 0.0 {
                            start += player.controller.max_frame();
                        }
                        player.remaining_frames_for_start_of_accel = start;
                        player.remaining_frames_for_end_of_accel = start + change_length;
                    }
                }
                player.accel_status = AccelStatus::Waiting;
                return true;
            }
        }
        false
    }

    // ========================================
    // 每帧推进
    // ========================================

    /// 推进全部播放器，返回是否有播放器发生状态变化。
    /// 淡出走完的播放器在本次调用尾部被紧缩移除。
    pub fn update(&mut self, bones: &mut BoneSet, morphs: &mut MorphManager, frame: f64) -> bool {
        self.display_request = None;

        if self.beginning_non_controlled_blend > 0.0 {
            // full 启动初期，未被基础动作控制的骨骼/表情渐进回中立
            self.beginning_non_controlled_blend =
                (self.beginning_non_controlled_blend - frame as f32).max(0.0);
            let rate = self.beginning_non_controlled_blend / self.config.non_controlled_reset_frames;
            bones.smear_to_neutral(rate);
            morphs.smear_weights(rate);
        }

        for player in &mut self.players {
            player.status = MotionStatus::Running;
        }

        for player in &mut self.players {
            if !player.active {
                continue;
            }

            if player.is_ending() {
                // 淡出状态：混合率随剩余帧数线性收缩
                if player.want_delete {
                    player.status = MotionStatus::Deleted;
                    player.want_delete = false;
                }
                player.controller.set_bone_blend_rate(
                    player.motion_blend_rate * player.ending_bone_blend
                        / player.ending_bone_blend_frames,
                );
                player
                    .controller
                    .set_face_blend_rate(player.ending_face_blend / player.ending_face_blend_frames);
                let (_, display) = player.controller.advance(
                    frame * player.current_speed_rate as f64,
                    bones,
                    morphs,
                );
                if let Some(d) = display {
                    self.display_request = Some(d);
                }
                player.ending_bone_blend = (player.ending_bone_blend - frame as f32).max(0.0);
                player.ending_face_blend = (player.ending_face_blend - frame as f32).max(0.0);
                if player.ending_bone_blend == 0.0 && player.ending_face_blend == 0.0 {
                    player.active = false;
                }
            } else {
                player.controller.set_bone_blend_rate(player.motion_blend_rate);
                // 正常播放时表情不吃混合率
                player.controller.set_face_blend_rate(1.0);

                let advanced = frame * player.current_speed_rate as f64;
                let (finished, display) = player.controller.advance(advanced, bones, morphs);
                if let Some(d) = display {
                    self.display_request = Some(d);
                }
                if finished {
                    match player.on_end {
                        EndBehavior::HoldLastPose => {}
                        EndBehavior::Loop => {
                            // 空动作回绕会死循环，跳过
                            if player.controller.max_frame() != 0.0 {
                                player.controller.rewind(player.loop_at, advanced);
                                player.status = MotionStatus::Looped;
                            }
                        }
                        EndBehavior::Disappear => {
                            if player.enable_smooth {
                                player.ending_bone_blend = player.ending_bone_blend_frames;
                                player.ending_face_blend = player.ending_face_blend_frames;
                            } else {
                                player.active = false;
                            }
                            player.status = MotionStatus::Deleted;
                        }
                    }
                }
                if player.want_delete {
                    if player.enable_smooth {
                        player.ending_bone_blend = player.ending_bone_blend_frames;
                        player.ending_face_blend = player.ending_face_blend_frames;
                    } else {
                        player.active = false;
                    }
                    player.status = MotionStatus::Deleted;
                    player.want_delete = false;
                }
            }
        }

        let changed = self
            .players
            .iter()
            .any(|p| p.status != MotionStatus::Running);

        // 标记-紧缩：播完且淡出结束的播放器在此移除
        self.players.retain(|p| p.active);

        changed
    }

    /// 推进变速状态机，返回是否有播放器刚到达目标速度
    pub fn update_speed_rates(&mut self, frame: f64) -> bool {
        let mut any_ended = false;
        for player in &mut self.players {
            if !player.active || player.accel_status == AccelStatus::Constant {
                continue;
            }
            if player.accel_status == AccelStatus::Ended {
                player.accel_status = AccelStatus::Constant;
                continue;
            }
            let f = frame as f32 * player.current_speed_rate;
            if player.accel_status == AccelStatus::Waiting {
                player.remaining_frames_for_start_of_accel -= f;
                if player.remaining_frames_for_start_of_accel <= 0.0 {
                    player.accel_status = AccelStatus::Changing;
                }
            }
            player.remaining_frames_for_end_of_accel -= f;
            if player.accel_status == AccelStatus::Changing {
                if player.remaining_frames_for_end_of_accel <= 0.0 {
                    player.current_speed_rate = player.target_speed_rate;
                    player.accel_status = AccelStatus::Ended;
                    any_ended = true;
                } else {
                    player.current_speed_rate += (player.target_speed_rate
                        - player.current_speed_rate)
                        * (frame as f32 / (player.remaining_frames_for_end_of_accel + frame as f32));
                }
            }
        }
        any_ended
    }

    // ========================================
    // 查询
    // ========================================

    /// 全部播放器（升序优先级）
    #[inline]
    pub fn players(&self) -> &[MotionPlayer] {
        &self.players
    }

    /// 按名称找正在运行（非淡出）的播放器
    pub fn running_player(&self, name: &str) -> Option<&MotionPlayer> {
        self.players
            .iter()
            .find(|p| p.active && !p.is_ending() && p.name == name)
    }

    /// 本次 update 中开关轨道要求的显示状态
    #[inline]
    pub fn take_display_request(&mut self) -> Option<bool> {
        self.display_request.take()
    }

    /// 模型热替换后重新绑定全部播放器，保留各自时钟
    pub fn rebind_model(&mut self, bones: &BoneSet, morphs: &MorphManager) {
        for player in &mut self.players {
            let current = player.controller.current_frame();
            let previous = player.controller.previous_frame();
            player.controller =
                MotionController::new(player.clip.clone(), bones, morphs, &self.config);
            player.controller.set_current_frame(current);
            player.controller.set_previous_frame(previous);
        }
    }

    // ========================================
    // 内部
    // ========================================

    /// 终止同名且处于淡出状态的播放器（顶替用）
    fn terminate_ending_motion(&mut self, name: &str) {
        for player in &mut self.players {
            if player.active && player.is_ending() && player.name == name {
                player.active = false;
            }
        }
    }

    fn purge_inactive(&mut self) {
        self.players.retain(|p| p.active);
    }
}
