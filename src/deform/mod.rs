//! CPU 蒙皮
//!
//! 每顶点按绑定方式混合 1/2/4 根控制骨骼的蒙皮变换
//! （世界变换 ∘ 平移(-绑定位置)），输出最终位置与法线。
//! SDEF 额外使用两个辅助修正点，减轻关节处的塌陷。
//! 顶点循环相互独立，用 rayon 并行。

use glam::{Mat4, Quat, Vec3};
use rayon::prelude::*;

use crate::skeleton::BoneSet;
use crate::{MmdError, Result};

/// 权重快速路径阈值：超过 1-ε 或低于 ε 时只取单骨骼
const MIN_BONE_WEIGHT: f32 = 0.0001;

/// 顶点蒙皮绑定
#[derive(Clone, Copy, Debug)]
pub enum SkinBinding {
    /// 单骨骼
    Bdef1 { bone: u32 },
    /// 双骨骼线性混合，`weight` 为第一根骨骼的权重
    Bdef2 { bones: [u32; 2], weight: f32 },
    /// 四骨骼线性混合，权重已归一
    Bdef4 { bones: [u32; 4], weights: [f32; 4] },
    /// 球面混合变体：c 为形变中心，r0/r1 为两骨骼侧的辅助点
    Sdef {
        bones: [u32; 2],
        weight: f32,
        c: Vec3,
        r0: Vec3,
        r1: Vec3,
    },
}

/// 蒙皮输出（每顶点位置+法线，渲染层直接消费）
#[derive(Default)]
pub struct SkinOutput {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
}

/// 蒙皮器
pub struct Skinner {
    bindings: Vec<SkinBinding>,
    /// 每骨骼蒙皮变换缓存（每帧重算）
    skin_trans: Vec<Mat4>,
    /// 每骨骼世界旋转缓存（SDEF 用）
    skin_rots: Vec<Quat>,
}

impl Skinner {
    pub fn new(bindings: Vec<SkinBinding>) -> Self {
        Self {
            bindings,
            skin_trans: Vec::new(),
            skin_rots: Vec::new(),
        }
    }

    /// 顶点数
    #[inline]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// 是否为空
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// 装配校验：骨骼索引在范围内、权重归一
    pub fn validate(&self, bone_count: usize) -> Result<()> {
        for (vertex, binding) in self.bindings.iter().enumerate() {
            let check = |index: u32| -> Result<()> {
                if index as usize >= bone_count {
                    return Err(MmdError::SkinBinding {
                        vertex,
                        reason: format!("bone index {index} out of range"),
                    });
                }
                Ok(())
            };
            match binding {
                SkinBinding::Bdef1 { bone } => check(*bone)?,
                SkinBinding::Bdef2 { bones, weight }
                | SkinBinding::Sdef { bones, weight, .. } => {
                    check(bones[0])?;
                    check(bones[1])?;
                    if !(-0.001..=1.001).contains(weight) {
                        return Err(MmdError::SkinBinding {
                            vertex,
                            reason: format!("weight {weight} outside [0, 1]"),
                        });
                    }
                }
                SkinBinding::Bdef4 { bones, weights } => {
                    for &b in bones {
                        check(b)?;
                    }
                    let sum: f32 = weights.iter().sum();
                    if (sum - 1.0).abs() > 0.01 {
                        return Err(MmdError::SkinBinding {
                            vertex,
                            reason: format!("weights sum to {sum}"),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// 蒙皮：骨骼解算完成后调用，`positions` 为 Morph 处理后的顶点位置
    pub fn update(
        &mut self,
        bones: &BoneSet,
        positions: &[Vec3],
        normals: &[Vec3],
        out: &mut SkinOutput,
    ) {
        bones.skinning_transforms(&mut self.skin_trans);
        self.skin_rots.clear();
        self.skin_rots
            .extend(bones.bones().iter().map(|b| b.world_rotation()));

        out.positions.resize(positions.len(), Vec3::ZERO);
        out.normals.resize(normals.len(), Vec3::ZERO);

        let bindings = &self.bindings;
        let trans = &self.skin_trans;
        let rots = &self.skin_rots;

        out.positions
            .par_iter_mut()
            .zip(out.normals.par_iter_mut())
            .enumerate()
            .for_each(|(i, (out_pos, out_nrm))| {
                let (v, n) = skin_vertex(&bindings[i], trans, rots, positions[i], normals[i]);
                *out_pos = v;
                *out_nrm = n;
            });
    }
}

/// 单顶点混合
fn skin_vertex(
    binding: &SkinBinding,
    trans: &[Mat4],
    rots: &[Quat],
    vertex: Vec3,
    normal: Vec3,
) -> (Vec3, Vec3) {
    match *binding {
        SkinBinding::Bdef1 { bone } => {
            let t = &trans[bone as usize];
            (t.transform_point3(vertex), t.transform_vector3(normal))
        }
        SkinBinding::Bdef2 { bones, weight } => {
            if weight >= 1.0 - MIN_BONE_WEIGHT {
                let t = &trans[bones[0] as usize];
                (t.transform_point3(vertex), t.transform_vector3(normal))
            } else if weight <= MIN_BONE_WEIGHT {
                let t = &trans[bones[1] as usize];
                (t.transform_point3(vertex), t.transform_vector3(normal))
            } else {
                let t0 = &trans[bones[0] as usize];
                let t1 = &trans[bones[1] as usize];
                let v = t0.transform_point3(vertex);
                let v2 = t1.transform_point3(vertex);
                let n = t0.transform_vector3(normal);
                let n2 = t1.transform_vector3(normal);
                (v2.lerp(v, weight), n2.lerp(n, weight))
            }
        }
        SkinBinding::Bdef4 { bones, weights } => {
            let mut v = Vec3::ZERO;
            let mut n = Vec3::ZERO;
            for k in 0..4 {
                let t = &trans[bones[k] as usize];
                v += t.transform_point3(vertex) * weights[k];
                n += t.transform_vector3(normal) * weights[k];
            }
            (v, n)
        }
        SkinBinding::Sdef {
            bones,
            weight,
            c,
            r0,
            r1,
        } => {
            let rot1 = rots[bones[0] as usize];
            let mut rot2 = rots[bones[1] as usize];
            // 同半球化，避免 slerp 走长弧
            if rot2.dot(rot1) < 0.0 {
                rot2 = -rot2;
            }
            let blended_rot = rot2.slerp(rot1, weight);

            let t0 = &trans[bones[0] as usize];
            let t1 = &trans[bones[1] as usize];
            let v = t0.transform_point3(r0);
            let v2 = t1.transform_point3(r1);
            let mut vv = v2.lerp(v, weight);
            vv += blended_rot * (vertex - c);

            let n = t0.transform_vector3(normal);
            let n2 = t1.transform_vector3(normal);
            (vv, n2.lerp(n, weight))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::skeleton::BoneSpec;

    fn chain_bones() -> BoneSet {
        let specs = vec![
            BoneSpec::new("root", Vec3::ZERO, None),
            BoneSpec::new("mid", Vec3::new(0.0, 1.0, 0.0), Some(0)),
        ];
        BoneSet::build(specs, Vec::new(), &EngineConfig::default()).unwrap()
    }

    #[test]
    fn bdef1_rest_pose_unchanged() {
        let mut bones = chain_bones();
        bones.update_before_physics(&EngineConfig::default());
        let mut skinner = Skinner::new(vec![SkinBinding::Bdef1 { bone: 0 }]);
        let mut out = SkinOutput::default();
        let positions = [Vec3::new(0.3, 0.5, 0.1)];
        let normals = [Vec3::Y];
        skinner.update(&bones, &positions, &normals, &mut out);
        assert!((out.positions[0] - positions[0]).length() < 1e-6);
        assert!((out.normals[0] - Vec3::Y).length() < 1e-6);
    }

    #[test]
    fn bdef1_follows_bone_translation() {
        let mut bones = chain_bones();
        bones.bone_mut(0).pos = Vec3::new(2.0, 0.0, 0.0);
        bones.update_before_physics(&EngineConfig::default());
        let mut skinner = Skinner::new(vec![SkinBinding::Bdef1 { bone: 0 }]);
        let mut out = SkinOutput::default();
        skinner.update(&bones, &[Vec3::ZERO], &[Vec3::Y], &mut out);
        assert!((out.positions[0] - Vec3::new(2.0, 0.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn bdef2_blends_halfway() {
        let mut bones = chain_bones();
        bones.bone_mut(1).pos = Vec3::new(2.0, 0.0, 0.0);
        bones.update_before_physics(&EngineConfig::default());
        let mut skinner = Skinner::new(vec![SkinBinding::Bdef2 {
            bones: [0, 1],
            weight: 0.5,
        }]);
        let mut out = SkinOutput::default();
        // 骨骼 0 静止、骨骼 1 平移 2：半权重顶点移动 1
        skinner.update(&bones, &[Vec3::ZERO], &[Vec3::Y], &mut out);
        assert!((out.positions[0] - Vec3::new(1.0, 0.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn bdef2_weight_epsilon_fast_path() {
        let mut bones = chain_bones();
        bones.bone_mut(1).pos = Vec3::new(2.0, 0.0, 0.0);
        bones.update_before_physics(&EngineConfig::default());
        let mut skinner = Skinner::new(vec![SkinBinding::Bdef2 {
            bones: [0, 1],
            weight: 1.0,
        }]);
        let mut out = SkinOutput::default();
        skinner.update(&bones, &[Vec3::ZERO], &[Vec3::Y], &mut out);
        assert!(out.positions[0].length() < 1e-6);
    }

    #[test]
    fn bdef4_weighted_sum() {
        let mut bones = chain_bones();
        bones.bone_mut(1).pos = Vec3::new(4.0, 0.0, 0.0);
        bones.update_before_physics(&EngineConfig::default());
        let mut skinner = Skinner::new(vec![SkinBinding::Bdef4 {
            bones: [0, 1, 0, 0],
            weights: [0.25, 0.25, 0.25, 0.25],
        }]);
        let mut out = SkinOutput::default();
        skinner.update(&bones, &[Vec3::ZERO], &[Vec3::Y], &mut out);
        assert!((out.positions[0] - Vec3::new(1.0, 0.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn sdef_rest_pose_identity() {
        let mut bones = chain_bones();
        bones.update_before_physics(&EngineConfig::default());
        let c = Vec3::new(0.0, 1.0, 0.0);
        let mut skinner = Skinner::new(vec![SkinBinding::Sdef {
            bones: [0, 1],
            weight: 0.5,
            c,
            r0: c,
            r1: c,
        }]);
        let vertex = Vec3::new(0.2, 1.1, 0.0);
        let mut out = SkinOutput::default();
        skinner.update(&bones, &[vertex], &[Vec3::Y], &mut out);
        assert!((out.positions[0] - vertex).length() < 1e-5);
    }

    #[test]
    fn validate_rejects_bad_binding() {
        let skinner = Skinner::new(vec![SkinBinding::Bdef1 { bone: 5 }]);
        assert!(matches!(
            skinner.validate(2),
            Err(MmdError::SkinBinding { .. })
        ));

        let skinner = Skinner::new(vec![SkinBinding::Bdef4 {
            bones: [0, 0, 0, 0],
            weights: [0.5, 0.5, 0.5, 0.5],
        }]);
        assert!(skinner.validate(1).is_err());
    }
}
