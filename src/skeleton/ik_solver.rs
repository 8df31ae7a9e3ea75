//! IK 求解器
//!
//! CCD 迭代求解：从最靠近终端的链节向根端依次摆动，使终端骨骼逼近
//! 目的地骨骼的位置。单步旋转受 `angle_constraint` 限幅，
//! 膝盖类骨骼只绕本地 X 轴弯曲（铰链关节）。
//! 数值上是尽力而为的近似解，不保证收敛。

use glam::{EulerRot, Quat, Vec3};
use std::f32::consts::PI;

use crate::config::IkTolerances;

use super::bone::{update_bone, Bone, BoneFlags};

/// IK 求解单元
///
/// 链条顺序：`chain[0]` 最靠近终端骨骼，末尾最靠近目的地。
/// 所有索引指向所属 BoneSet 的仲裁数组。
#[derive(Clone, Debug)]
pub struct IkSolver {
    /// 目的地骨骼（链条逼近的锚点）
    pub destination: usize,
    /// 终端骨骼（被拖动的骨骼）
    pub target: usize,
    /// 链上骨骼，终端侧在前
    pub chain: Vec<usize>,
    /// 迭代上限
    pub iterations: u32,
    /// 单步最大旋转角（弧度）
    pub angle_constraint: f32,
}

impl IkSolver {
    /// 整条链是否处于物理控制之下（此时求解会与模拟打架，应跳过）
    #[inline]
    pub fn is_simulated(&self, bones: &[Bone]) -> bool {
        self.chain
            .first()
            .map(|&i| bones[i].is_simulated())
            .unwrap_or(false)
    }

    /// 求解前把链上骨骼与终端骨骼的世界变换刷新到最新
    pub fn update_link_bones(&self, bones: &mut [Bone]) {
        for &idx in self.chain.iter().rev() {
            update_bone(bones, idx);
        }
        update_bone(bones, self.target);
    }

    /// 迭代求解，结果直接写入链上骨骼的当前旋转
    pub fn solve(&self, bones: &mut [Bone], tol: &IkTolerances) {
        if self.chain.is_empty() {
            return;
        }
        if !bones[self.destination].ik_switch() {
            return;
        }
        if self.is_simulated(bones) {
            return;
        }

        // 目的地的全局位置在迭代中不变
        let dest_pos = bones[self.destination].world_position();

        self.update_link_bones(bones);

        // 终端骨骼自身的旋转不属于求解结果，结束时恢复
        let orig_target_rot = bones[self.target].rot;

        'iteration: for ite in 0..self.iterations {
            for j in 0..self.chain.len() {
                let link_idx = self.chain[j];
                let target_pos = bones[self.target].world_position();
                let current_pos = bones[link_idx].world_position();

                // 链节与终端/目的地重合时跳过，避免零长向量
                if current_pos == target_pos || current_pos == dest_pos {
                    continue;
                }

                // 目的地与终端换算到链节本地坐标
                let inv = bones[link_idx].trans.inverse();
                let local_dest = inv.transform_point3(dest_pos);
                let local_target = inv.transform_point3(target_pos);

                // 足够接近则提前结束
                if local_dest.distance_squared(local_target) < tol.min_distance_sq {
                    break 'iteration;
                }

                let dest_vec = local_dest.normalize();
                let target_vec = local_target.normalize();

                let dot = dest_vec.dot(target_vec);
                if dot > 1.0 {
                    continue;
                }
                let mut angle = dot.max(-1.0).acos();
                if angle.abs() < tol.min_angle {
                    continue;
                }
                angle = angle.clamp(-self.angle_constraint, self.angle_constraint);

                let axis = target_vec.cross(dest_vec);
                let axis_len_sq = axis.length_squared();
                // 方向近平行时轴不可靠，首轮之外直接跳过
                if axis_len_sq < tol.min_axis_sq && ite > 0 {
                    continue;
                }
                if axis_len_sq < f32::EPSILON * f32::EPSILON {
                    continue;
                }
                let axis = axis.normalize();

                let mut rot = Quat::from_axis_angle(axis, angle);

                if bones[link_idx].flags.contains(BoneFlags::LIMIT_ANGLE_X) {
                    let (_, _, x) = rot.to_euler(EulerRot::ZYX);
                    let (_, _, cx) = bones[link_idx].rot.to_euler(EulerRot::ZYX);

                    if ite == 0 && cx < self.angle_constraint {
                        // 首轮强制向限制方向弯到最大步进，
                        // 多数模型（尤其是腿）能更早收敛
                        if angle < 0.0 {
                            angle = -angle;
                        }
                        rot = Quat::from_axis_angle(Vec3::X, angle);
                    } else {
                        // y/z 清零，x 限制在 [min_rot_sum, PI]
                        let mut cx = cx;
                        let mut x = x;
                        if cx < -PI * 0.5 {
                            cx += PI * 2.0;
                        }
                        if x + cx > PI {
                            x = PI - cx;
                        }
                        if tol.min_rot_sum > x + cx {
                            x = tol.min_rot_sum - cx;
                        }
                        if x.abs() < tol.min_rotation {
                            continue;
                        }
                        rot = Quat::from_rotation_x(x);
                    }
                    bones[link_idx].rot = rot * bones[link_idx].rot;
                } else {
                    bones[link_idx].rot = bones[link_idx].rot * rot;
                }

                // 刷新受影响的链节（从当前链节向终端侧）与终端骨骼
                for i in (0..=j).rev() {
                    update_bone(bones, self.chain[i]);
                }
                update_bone(bones, self.target);
            }
        }

        bones[self.target].rot = orig_target_rot;
        update_bone(bones, self.target);
    }
}
