//! 相机轨道播放
//!
//! 相机通道独立于骨骼/表情播放：六个子通道（位置 xyz、角度、距离、
//! 视野）各自带缓动插值。相邻极近的关键帧若参数跳变超过阈值，
//! 说明是刻意的镜头切换，此时不插值而直接取前一个键，
//! 避免样条过冲造成的镜头抖动。

use std::sync::Arc;

use glam::{Quat, Vec3};

use super::clip::{locate_keys, MotionClip};

/// 判定镜头切换的参数跳变阈值
const CAMERA_CUT_POS_DIST2: f32 = 3.0;
const CAMERA_CUT_ANGLE: f32 = 0.08;
const CAMERA_CUT_DISTANCE: f32 = 3.0;
const CAMERA_CUT_FOVY: f32 = 2.0;

/// 相机姿态
#[derive(Clone, Copy, Debug)]
pub struct CameraState {
    /// 注视点位置
    pub pos: Vec3,
    /// 欧拉角（度）
    pub angle: Vec3,
    /// 与注视点的距离
    pub distance: f32,
    /// 垂直视野（度）
    pub fovy: f32,
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            pos: Vec3::ZERO,
            angle: Vec3::ZERO,
            distance: 0.0,
            fovy: 0.0,
        }
    }
}

fn angle_to_quat(angle: Vec3) -> Quat {
    Quat::from_rotation_z(angle.z.to_radians())
        * Quat::from_rotation_x(angle.x.to_radians())
        * Quat::from_rotation_y(angle.y.to_radians())
}

/// 相机轨道控制器
pub struct CameraController {
    clip: Arc<MotionClip>,
    last_key: usize,
    max_frame: f32,
    current_frame: f64,
    previous_frame: f64,
    state: CameraState,
}

impl CameraController {
    /// 绑定一段带相机轨道的动作
    pub fn new(clip: Arc<MotionClip>) -> Self {
        let max_frame = clip
            .camera_keyframes()
            .last()
            .map(|k| k.frame)
            .unwrap_or(0.0);
        Self {
            clip,
            last_key: 0,
            max_frame,
            current_frame: 0.0,
            previous_frame: 0.0,
            state: CameraState::default(),
        }
    }

    /// 当前相机姿态
    #[inline]
    pub fn state(&self) -> CameraState {
        self.state
    }

    /// 当前帧
    #[inline]
    pub fn current_frame(&self) -> f64 {
        self.current_frame
    }

    /// 推进时钟并求值，到达末帧返回 true
    pub fn advance(&mut self, delta_frame: f64) -> bool {
        if self.clip.camera_keyframes().is_empty() {
            return false;
        }
        self.control(self.current_frame as f32);
        self.previous_frame = self.current_frame;
        self.current_frame += delta_frame;
        if self.current_frame >= self.max_frame as f64 {
            self.current_frame = self.max_frame as f64;
            return true;
        }
        false
    }

    /// 回绕到指定帧，保留溢出量
    pub fn rewind(&mut self, target_frame: f32, frame: f64) {
        self.current_frame =
            self.previous_frame + frame - self.max_frame as f64 + target_frame as f64;
        self.previous_frame = target_frame as f64;
    }

    /// 求指定帧的相机参数
    pub fn control(&mut self, frame_now: f32) {
        let clip = self.clip.clone();
        let keys = clip.camera_keyframes();
        let n = keys.len();
        if n == 0 {
            return;
        }
        let frame = frame_now.min(keys[n - 1].frame);

        let (k1, k2) = locate_keys(keys, |k| k.frame, frame, self.last_key);
        self.last_key = k1;

        let key1 = &keys[k1];
        let key2 = &keys[k2];
        let time1 = key1.frame;
        let time2 = key2.frame;

        if time1 == time2 {
            self.state = CameraState {
                pos: key1.pos,
                angle: key1.angle,
                distance: key1.distance,
                fovy: key1.fovy,
            };
            return;
        }

        let do_lerp = if frame <= time1 {
            self.state = CameraState {
                pos: key1.pos,
                angle: key1.angle,
                distance: key1.distance,
                fovy: key1.fovy,
            };
            false
        } else if frame >= time2 {
            self.state = CameraState {
                pos: key2.pos,
                angle: key2.angle,
                distance: key2.distance,
                fovy: key2.fovy,
            };
            false
        } else if time2 - time1 <= 1.0 {
            // 相邻帧：参数跳变超阈值按镜头切换处理，取前一个键
            let q_diff = angle_to_quat(key2.angle) * angle_to_quat(key1.angle).inverse();
            let angle_diff = 2.0 * q_diff.w.clamp(-1.0, 1.0).abs().acos();
            if key1.pos.distance_squared(key2.pos) > CAMERA_CUT_POS_DIST2
                || angle_diff > CAMERA_CUT_ANGLE
                || (key1.distance - key2.distance).abs() > CAMERA_CUT_DISTANCE
                || (key1.fovy - key2.fovy).abs() > CAMERA_CUT_FOVY
            {
                self.state = CameraState {
                    pos: key1.pos,
                    angle: key1.angle,
                    distance: key1.distance,
                    fovy: key1.fovy,
                };
                false
            } else {
                true
            }
        } else {
            true
        };

        if do_lerp {
            let w = (frame - time1) / (time2 - time1);
            let wx = key2.interp[0].apply(w);
            let wy = key2.interp[1].apply(w);
            let wz = key2.interp[2].apply(w);
            let wa = key2.interp[3].apply(w);
            let wd = key2.interp[4].apply(w);
            let wf = key2.interp[5].apply(w);
            self.state = CameraState {
                pos: Vec3::new(
                    key1.pos.x * (1.0 - wx) + key2.pos.x * wx,
                    key1.pos.y * (1.0 - wy) + key2.pos.y * wy,
                    key1.pos.z * (1.0 - wz) + key2.pos.z * wz,
                ),
                angle: key1.angle.lerp(key2.angle, wa),
                distance: key1.distance * (1.0 - wd) + key2.distance * wd,
                fovy: key1.fovy * (1.0 - wf) + key2.fovy * wf,
            };
        }
    }
}
