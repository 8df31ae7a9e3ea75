//! 骨骼集合
//!
//! 扁平仲裁数组持有全部骨骼，父子/目标/IK 关系一律存索引，
//! 不存在独立所有权，遍历 O(1) 且没有生命周期环。
//!
//! 装配期完成全部结构校验（越界引用、父链环），并预计算：
//! - 拓扑遍历序（运动独立骨骼在前，父先于子，与文件存储顺序无关）
//! - 被旋转骨骼的二次更新列表
//! - 物理前/后两趟按层分桶的处理列表

use std::collections::HashMap;

use glam::{Mat4, Quat, Vec3};

use crate::config::EngineConfig;
use crate::{MmdError, Result};

use super::bone::{update_bone, update_bone_after_simulation, Bone, BoneFlags, BoneKind};
use super::ik_solver::IkSolver;

// ============================================================================
// 装配输入
// ============================================================================

/// 骨骼装配描述（加载器产出）
#[derive(Clone, Debug)]
pub struct BoneSpec {
    /// 骨骼名
    pub name: String,
    /// 绑定姿态位置
    pub origin_position: Vec3,
    /// 父骨骼索引
    pub parent: Option<usize>,
    /// 骨骼种类（链接索引随变体给出）
    pub kind: BoneKind,
    /// 是否物理步后处理
    pub after_physics: bool,
    /// 物理后处理层号
    pub process_layer: i32,
}

impl BoneSpec {
    /// 普通骨骼的简便构造
    pub fn new(name: impl Into<String>, origin_position: Vec3, parent: Option<usize>) -> Self {
        Self {
            name: name.into(),
            origin_position,
            parent,
            kind: BoneKind::Normal,
            after_physics: false,
            process_layer: 0,
        }
    }
}

/// IK 单元装配描述
#[derive(Clone, Debug)]
pub struct IkSpec {
    /// 目的地骨骼索引
    pub destination: usize,
    /// 终端骨骼索引
    pub target: usize,
    /// 链上骨骼索引，终端侧在前
    pub chain: Vec<usize>,
    /// 迭代上限
    pub iterations: u32,
    /// 单步最大旋转角（弧度）
    pub angle_constraint: f32,
}

// ============================================================================
// 骨骼集合
// ============================================================================

/// 骨骼集合
pub struct BoneSet {
    bones: Vec<Bone>,
    name_to_index: HashMap<String, usize>,
    ik_units: Vec<IkSolver>,

    /// 拓扑遍历序（仅非扩展模式使用）
    ordered: Vec<usize>,
    /// 被旋转骨骼，IK 之后需要二次更新
    under_rotate: Vec<usize>,
    /// 目的地骨骼 -> IK 单元索引
    dest_ik: Vec<Option<usize>>,

    /// 扩展模式：存在物理后处理骨骼或非零层号时按层走两趟
    extended: bool,
    /// 物理前各层的骨骼（按装配顺序）
    layers_before: Vec<Vec<usize>>,
    /// 物理后各层的骨骼
    layers_after: Vec<Vec<usize>>,

    root_bone: Option<usize>,
    center_bone: Option<usize>,
}

impl BoneSet {
    /// 装配骨骼集合，任何非法引用都使整个装配失败
    pub fn build(
        specs: Vec<BoneSpec>,
        ik_specs: Vec<IkSpec>,
        config: &EngineConfig,
    ) -> Result<Self> {
        let count = specs.len();

        let check = |bone: &str, index: usize| -> Result<()> {
            if index >= count {
                return Err(MmdError::BoneIndex {
                    bone: bone.to_string(),
                    index,
                });
            }
            Ok(())
        };

        // 结构校验：父/子/目标引用
        for spec in &specs {
            if let Some(p) = spec.parent {
                check(&spec.name, p)?;
            }
            match spec.kind {
                BoneKind::UnderRotate { target } => check(&spec.name, target)?,
                BoneKind::CoRotate { child, .. } | BoneKind::CoMove { child, .. } => {
                    check(&spec.name, child)?
                }
                _ => {}
            }
        }

        // 父链环检测
        for spec in &specs {
            let mut cursor = spec.parent;
            let mut steps = 0;
            while let Some(p) = cursor {
                steps += 1;
                if steps > count {
                    return Err(MmdError::BoneCycle {
                        bone: spec.name.clone(),
                    });
                }
                cursor = specs[p].parent;
            }
        }

        // IK 引用校验
        for ik in &ik_specs {
            if ik.destination >= count {
                return Err(MmdError::IkIndex {
                    which: "destination",
                    index: ik.destination,
                });
            }
            if ik.target >= count {
                return Err(MmdError::IkIndex {
                    which: "target",
                    index: ik.target,
                });
            }
            for &link in &ik.chain {
                if link >= count {
                    return Err(MmdError::IkIndex {
                        which: "chain",
                        index: link,
                    });
                }
            }
        }

        // 创建骨骼
        let mut bones: Vec<Bone> = Vec::with_capacity(count);
        let mut name_to_index = HashMap::with_capacity(count);
        for (i, spec) in specs.iter().enumerate() {
            let mut bone = Bone::new(spec.name.clone(), spec.origin_position);
            bone.id = i;
            bone.parent = spec.parent;
            bone.kind = spec.kind;
            bone.process_layer = spec.process_layer;
            bone.flags.set(BoneFlags::AFTER_PHYSICS, spec.after_physics);
            if spec.name.contains(&config.knee_bone_mark) {
                bone.flags.insert(BoneFlags::LIMIT_ANGLE_X);
            }
            if name_to_index.insert(spec.name.clone(), i).is_some() {
                log::warn!("[skeleton] duplicate bone name '{}', later one wins", spec.name);
            }
            bones.push(bone);
        }

        // 固定偏移
        for i in 0..count {
            let parent_origin = bones[i].parent.map(|p| bones[p].origin_position);
            bones[i].compute_offset(parent_origin);
        }

        // 运动独立标记：无父骨骼、父为模型根、或父为辅助根名
        for i in 0..count {
            let independent = match bones[i].parent {
                None => true,
                Some(p) => {
                    bones[p].kind == BoneKind::Root
                        || config
                            .auxiliary_root_names
                            .iter()
                            .any(|n| n == &bones[p].name)
                }
            };
            bones[i]
                .flags
                .set(BoneFlags::MOTION_INDEPENDENT, independent);
        }

        // 拓扑遍历序：先无父骨骼，再反复把父不在前面的骨骼挪到末尾
        let mut ordered: Vec<usize> = (0..count).filter(|&i| bones[i].parent.is_none()).collect();
        let head = ordered.len();
        ordered.extend((0..count).filter(|&i| bones[i].parent.is_some()));
        loop {
            let mut moved = false;
            let mut j = head;
            while j < ordered.len() {
                let parent = bones[ordered[j]].parent.unwrap();
                if ordered[..j].contains(&parent) {
                    j += 1;
                } else {
                    let b = ordered.remove(j);
                    ordered.push(b);
                    moved = true;
                }
            }
            if !moved {
                break;
            }
        }

        let under_rotate: Vec<usize> = (0..count)
            .filter(|&i| matches!(bones[i].kind, BoneKind::UnderRotate { .. }))
            .collect();

        // IK 单元
        let mut ik_units = Vec::with_capacity(ik_specs.len());
        let mut dest_ik = vec![None; count];
        for (u, ik) in ik_specs.into_iter().enumerate() {
            dest_ik[ik.destination] = Some(u);
            ik_units.push(IkSolver {
                destination: ik.destination,
                target: ik.target,
                chain: ik.chain,
                iterations: ik.iterations,
                angle_constraint: ik.angle_constraint,
            });
        }

        // 层分桶
        let extended =
            bones.iter().any(|b| b.after_physics() || b.process_layer != 0);
        let max_layer = bones.iter().map(|b| b.process_layer).max().unwrap_or(0).max(0) as usize;
        let mut layers_before = vec![Vec::new(); max_layer + 1];
        let mut layers_after = vec![Vec::new(); max_layer + 1];
        for (i, bone) in bones.iter().enumerate() {
            let layer = bone.process_layer.max(0) as usize;
            if bone.after_physics() {
                layers_after[layer].push(i);
            } else {
                layers_before[layer].push(i);
            }
        }

        let root_bone = (0..count).find(|&i| bones[i].kind == BoneKind::Root);
        let center_bone = name_to_index.get(&config.center_bone_name).copied();

        let mut set = Self {
            bones,
            name_to_index,
            ik_units,
            ordered,
            under_rotate,
            dest_ik,
            extended,
            layers_before,
            layers_after,
            root_bone,
            center_bone,
        };

        // 绑定姿态下先算一遍世界变换，并保存为刚体锚点
        set.update_rest_pose();
        Ok(set)
    }

    /// 绑定姿态全量更新并保存锚点变换
    fn update_rest_pose(&mut self) {
        for i in 0..self.ordered.len() {
            let idx = self.ordered[i];
            update_bone(&mut self.bones, idx);
        }
        for bone in &mut self.bones {
            bone.save_trans();
        }
    }

    // ========================================
    // 访问器
    // ========================================

    /// 骨骼数量
    #[inline]
    pub fn len(&self) -> usize {
        self.bones.len()
    }

    /// 是否为空
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bones.is_empty()
    }

    /// 按名称查找骨骼索引
    #[inline]
    pub fn find(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    /// 取骨骼
    #[inline]
    pub fn bone(&self, index: usize) -> &Bone {
        &self.bones[index]
    }

    /// 取可变骨骼
    #[inline]
    pub fn bone_mut(&mut self, index: usize) -> &mut Bone {
        &mut self.bones[index]
    }

    /// 骨骼切片
    #[inline]
    pub fn bones(&self) -> &[Bone] {
        &self.bones
    }

    /// 可变骨骼切片
    #[inline]
    pub fn bones_mut(&mut self) -> &mut [Bone] {
        &mut self.bones
    }

    /// IK 单元
    #[inline]
    pub fn ik_units(&self) -> &[IkSolver] {
        &self.ik_units
    }

    /// 模型根骨骼
    #[inline]
    pub fn root_bone(&self) -> Option<usize> {
        self.root_bone
    }

    /// 中心骨骼
    #[inline]
    pub fn center_bone(&self) -> Option<usize> {
        self.center_bone
    }

    /// 立即更新单个骨骼的世界变换
    #[inline]
    pub fn update_at(&mut self, index: usize) {
        update_bone(&mut self.bones, index);
    }

    // ========================================
    // 每帧处理
    // ========================================

    /// 帧首：IK 链与终端骨骼的姿态完全由求解器决定，先清零
    pub fn reset_ik_controlled(&mut self) {
        for bone in &mut self.bones {
            if matches!(bone.kind, BoneKind::UnderIk | BoneKind::IkTarget) {
                bone.pos = Vec3::ZERO;
                bone.rot = Quat::IDENTITY;
            }
        }
    }

    /// 帧首：清空 Morph 累积量
    pub fn reset_morphs(&mut self) {
        for bone in &mut self.bones {
            bone.reset_morph();
        }
    }

    /// 物理步之前的姿态解算
    ///
    /// 非扩展模式：拓扑序全量更新 → 逐 IK 求解 → 被旋转骨骼二次更新。
    /// 扩展模式：按层号升序，每层内按装配序更新并就地求解 IK，
    /// 最后补一遍协旋转骨骼。
    pub fn update_before_physics(&mut self, config: &EngineConfig) {
        if !self.extended {
            for i in 0..self.ordered.len() {
                let idx = self.ordered[i];
                update_bone(&mut self.bones, idx);
            }
            for unit in &self.ik_units {
                unit.solve(&mut self.bones, &config.ik);
            }
            for i in 0..self.under_rotate.len() {
                let idx = self.under_rotate[i];
                update_bone(&mut self.bones, idx);
            }
        } else {
            self.update_layered(config, false);
        }
    }

    /// 物理步之后的姿态解算（仅扩展模式有事可做）
    pub fn update_after_physics(&mut self, config: &EngineConfig) {
        if self.extended {
            self.update_layered(config, true);
        }
    }

    fn update_layered(&mut self, config: &EngineConfig, after_physics: bool) {
        let layers = if after_physics {
            std::mem::take(&mut self.layers_after)
        } else {
            std::mem::take(&mut self.layers_before)
        };

        for bucket in &layers {
            for &idx in bucket {
                if after_physics {
                    update_bone_after_simulation(&mut self.bones, idx);
                } else {
                    update_bone(&mut self.bones, idx);
                }
                if let Some(u) = self.dest_ik[idx] {
                    // 层内就地求解，链上骨骼先刷新
                    let unit = &self.ik_units[u];
                    unit.update_link_bones(&mut self.bones);
                    unit.solve(&mut self.bones, &config.ik);
                }
            }
            // 协旋转骨骼依赖同层其它骨骼的最终旋转，层尾补一遍
            for &idx in bucket {
                if matches!(self.bones[idx].kind, BoneKind::CoRotate { .. }) {
                    if after_physics {
                        update_bone_after_simulation(&mut self.bones, idx);
                    } else {
                        update_bone(&mut self.bones, idx);
                    }
                }
            }
        }

        if after_physics {
            self.layers_after = layers;
        } else {
            self.layers_before = layers;
        }
    }

    // ========================================
    // 物理同步
    // ========================================

    /// 物理同步开始，清除上一帧的物理变换记录
    pub fn clear_simulated_transforms(&mut self) {
        for bone in &mut self.bones {
            bone.clear_trans_by_simulation();
        }
    }

    /// 写入物理给出的骨骼世界变换
    #[inline]
    pub fn supply_simulated_transform(&mut self, index: usize, trans: Mat4) {
        self.bones[index].set_trans_by_simulation(trans);
    }

    // ========================================
    // 杂项
    // ========================================

    /// 全骨骼姿态向中立姿态收拢（rate 1.0 保持，0.0 完全回零）
    pub fn smear_to_neutral(&mut self, rate: f32) {
        for bone in &mut self.bones {
            bone.pos *= rate;
            bone.rot = Quat::IDENTITY.slerp(bone.rot, rate);
        }
    }

    /// 按名称切换 IK 开关，未知名称返回 false
    pub fn set_ik_switch_by_name(&mut self, name: &str, flag: bool) -> bool {
        match self.find(name) {
            Some(i) => {
                self.bones[i].set_ik_switch(flag);
                true
            }
            None => false,
        }
    }

    /// 计算全部骨骼的蒙皮变换
    pub fn skinning_transforms(&self, out: &mut Vec<Mat4>) {
        out.clear();
        out.extend(self.bones.iter().map(|b| b.skinning_trans()));
    }
}
