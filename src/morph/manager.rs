//! Morph 管理器

use std::collections::HashMap;

use glam::{Quat, Vec2, Vec3, Vec4};

use crate::skeleton::Bone;
use crate::{MmdError, Result};

use super::{
    MaterialMorphOffset, MaterialMorphOp, Morph, MorphKind, MIN_MORPH_WEIGHT,
};

/// 组 Morph 递归深度上限（防循环引用）
const GROUP_MORPH_MAX_DEPTH: u32 = 16;

// ============================================================================
// 材质 Morph 结果
// ============================================================================

/// 材质 Morph 结果（每材质一个，累计所有材质 Morph 的影响）
#[derive(Clone, Debug)]
pub struct MaterialMorphResult {
    pub diffuse: Vec4,
    pub specular: Vec3,
    pub specular_strength: f32,
    pub ambient: Vec3,
    pub edge_color: Vec4,
    pub edge_size: f32,
    pub texture_tint: Vec4,
    pub environment_tint: Vec4,
    pub toon_tint: Vec4,
}

impl MaterialMorphResult {
    pub fn new() -> Self {
        Self {
            diffuse: Vec4::ONE,
            specular: Vec3::ONE,
            specular_strength: 1.0,
            ambient: Vec3::ONE,
            edge_color: Vec4::new(0.0, 0.0, 0.0, 1.0),
            edge_size: 1.0,
            texture_tint: Vec4::ONE,
            environment_tint: Vec4::ONE,
            toon_tint: Vec4::ONE,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// 乘算混合
    pub fn apply_multiply(&mut self, offset: &MaterialMorphOffset, weight: f32) {
        let mul4 = |base: Vec4, target: Vec4, w: f32| base * (Vec4::ONE + (target - Vec4::ONE) * w);
        let mul3 = |base: Vec3, target: Vec3, w: f32| base * (Vec3::ONE + (target - Vec3::ONE) * w);
        self.diffuse = mul4(self.diffuse, offset.diffuse, weight);
        self.specular = mul3(self.specular, offset.specular, weight);
        self.specular_strength *= 1.0 + (offset.specular_strength - 1.0) * weight;
        self.ambient = mul3(self.ambient, offset.ambient, weight);
        self.edge_color = mul4(self.edge_color, offset.edge_color, weight);
        self.edge_size *= 1.0 + (offset.edge_size - 1.0) * weight;
        self.texture_tint = mul4(self.texture_tint, offset.texture_tint, weight);
        self.environment_tint = mul4(self.environment_tint, offset.environment_tint, weight);
        self.toon_tint = mul4(self.toon_tint, offset.toon_tint, weight);
    }

    /// 加算混合
    pub fn apply_additive(&mut self, offset: &MaterialMorphOffset, weight: f32) {
        self.diffuse += offset.diffuse * weight;
        self.specular += offset.specular * weight;
        self.specular_strength += offset.specular_strength * weight;
        self.ambient += offset.ambient * weight;
        self.edge_color += offset.edge_color * weight;
        self.edge_size += offset.edge_size * weight;
        self.texture_tint += offset.texture_tint * weight;
        self.environment_tint += offset.environment_tint * weight;
        self.toon_tint += offset.toon_tint * weight;
    }
}

impl Default for MaterialMorphResult {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Morph 管理器
// ============================================================================

/// Morph 管理器
///
/// 持有全部命名 Morph 与每帧求值的结果缓冲区。
pub struct MorphManager {
    morphs: Vec<Morph>,
    name_to_index: HashMap<String, usize>,

    /// UV Morph 偏移（每顶点）
    uv_deltas: Vec<Vec2>,
    /// 材质 Morph 结果（每材质）
    material_results: Vec<MaterialMorphResult>,
}

impl MorphManager {
    pub fn new() -> Self {
        Self {
            morphs: Vec::new(),
            name_to_index: HashMap::new(),
            uv_deltas: Vec::new(),
            material_results: Vec::new(),
        }
    }

    /// 注册 Morph
    pub fn add_morph(&mut self, morph: Morph) {
        let index = self.morphs.len();
        if self
            .name_to_index
            .insert(morph.name.clone(), index)
            .is_some()
        {
            log::warn!("[morph] duplicate morph name '{}', later one wins", morph.name);
        }
        self.morphs.push(morph);
    }

    /// 装配校验：所有成员引用都必须在范围内
    pub fn validate(&self, bone_count: usize, vertex_count: usize, material_count: usize) -> Result<()> {
        let morph_count = self.morphs.len();
        for morph in &self.morphs {
            let fail = |index: usize| MmdError::MorphIndex {
                morph: morph.name.clone(),
                index,
            };
            for o in &morph.vertex_offsets {
                if o.vertex_index as usize >= vertex_count {
                    return Err(fail(o.vertex_index as usize));
                }
            }
            for o in &morph.uv_offsets {
                if o.vertex_index as usize >= vertex_count {
                    return Err(fail(o.vertex_index as usize));
                }
            }
            for o in &morph.bone_offsets {
                if o.bone_index as usize >= bone_count {
                    return Err(fail(o.bone_index as usize));
                }
            }
            for o in &morph.material_offsets {
                if let Some(m) = o.material_index {
                    if m as usize >= material_count {
                        return Err(fail(m as usize));
                    }
                }
            }
            for o in &morph.group_offsets {
                if o.morph_index as usize >= morph_count {
                    return Err(fail(o.morph_index as usize));
                }
            }
        }
        Ok(())
    }

    /// 初始化结果缓冲区
    pub fn init_buffers(&mut self, vertex_count: usize, material_count: usize) {
        self.uv_deltas = vec![Vec2::ZERO; vertex_count];
        self.material_results = vec![MaterialMorphResult::new(); material_count];
    }

    // ========================================
    // 访问器
    // ========================================

    /// Morph 数量
    #[inline]
    pub fn len(&self) -> usize {
        self.morphs.len()
    }

    /// 是否为空
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.morphs.is_empty()
    }

    /// 按名称查找
    #[inline]
    pub fn find(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    /// 取 Morph
    #[inline]
    pub fn morph(&self, index: usize) -> &Morph {
        &self.morphs[index]
    }

    /// 取权重
    #[inline]
    pub fn weight(&self, index: usize) -> f32 {
        self.morphs[index].weight
    }

    /// 写权重
    #[inline]
    pub fn set_weight(&mut self, index: usize, weight: f32) {
        self.morphs[index].weight = weight;
    }

    /// 全部权重归零
    pub fn reset_all_weights(&mut self) {
        for morph in &mut self.morphs {
            morph.reset();
        }
    }

    /// 权重向零收拢（rate 1.0 保持，0.0 清零）
    pub fn smear_weights(&mut self, rate: f32) {
        for morph in &mut self.morphs {
            morph.weight *= rate;
        }
    }

    /// UV 偏移结果（每顶点）
    #[inline]
    pub fn uv_deltas(&self) -> &[Vec2] {
        &self.uv_deltas
    }

    /// 材质 Morph 结果（每材质）
    #[inline]
    pub fn material_results(&self) -> &[MaterialMorphResult] {
        &self.material_results
    }

    // ========================================
    // 每帧求值
    // ========================================

    /// 展开组 Morph，得到 (成员索引, 有效权重) 列表
    fn collect_effective(&self) -> Vec<(usize, f32)> {
        let mut out = Vec::new();
        for (i, morph) in self.morphs.iter().enumerate() {
            if morph.weight.abs() <= MIN_MORPH_WEIGHT {
                continue;
            }
            match morph.kind {
                MorphKind::Group => self.collect_group(i, morph.weight, 0, &mut out),
                _ => out.push((i, morph.weight)),
            }
        }
        out
    }

    fn collect_group(&self, index: usize, weight: f32, depth: u32, out: &mut Vec<(usize, f32)>) {
        if depth > GROUP_MORPH_MAX_DEPTH || weight.abs() <= MIN_MORPH_WEIGHT {
            return;
        }
        for offset in &self.morphs[index].group_offsets {
            let sub = offset.morph_index as usize;
            if sub == index {
                continue;
            }
            let sub_weight = weight * offset.influence;
            match self.morphs[sub].kind {
                MorphKind::Group => self.collect_group(sub, sub_weight, depth + 1, out),
                _ => {
                    if sub_weight.abs() > MIN_MORPH_WEIGHT {
                        out.push((sub, sub_weight));
                    }
                }
            }
        }
    }

    /// 把骨骼 Morph 累加到骨骼（动作写完权重后、骨骼更新前调用）
    pub fn apply_bone_morphs(&self, bones: &mut [Bone]) {
        for (index, weight) in self.collect_effective() {
            let morph = &self.morphs[index];
            if morph.kind != MorphKind::Bone {
                continue;
            }
            for offset in &morph.bone_offsets {
                let pos = offset.translation * weight;
                let rot = Quat::IDENTITY.slerp(offset.rotation, weight);
                bones[offset.bone_index as usize].add_morph(pos, rot);
            }
        }
    }

    /// 由静置位置重建受 Morph 影响的顶点位置
    pub fn apply_vertex_morphs(&self, rest: &[Vec3], out: &mut [Vec3]) {
        out.copy_from_slice(rest);
        for (index, weight) in self.collect_effective() {
            let morph = &self.morphs[index];
            if morph.kind != MorphKind::Vertex {
                continue;
            }
            for offset in &morph.vertex_offsets {
                out[offset.vertex_index as usize] += offset.offset * weight;
            }
        }
    }

    /// 重算 UV 偏移与材质结果
    pub fn apply_uv_material_morphs(&mut self) {
        for delta in &mut self.uv_deltas {
            *delta = Vec2::ZERO;
        }
        for result in &mut self.material_results {
            result.reset();
        }

        for (index, weight) in self.collect_effective() {
            let morph = &self.morphs[index];
            match morph.kind {
                MorphKind::Uv => {
                    for offset in &morph.uv_offsets {
                        self.uv_deltas[offset.vertex_index as usize] += offset.offset * weight;
                    }
                }
                MorphKind::Material => {
                    for offset in &morph.material_offsets {
                        match offset.material_index {
                            None => {
                                for result in &mut self.material_results {
                                    match offset.operation {
                                        MaterialMorphOp::Multiply => result.apply_multiply(offset, weight),
                                        MaterialMorphOp::Add => result.apply_additive(offset, weight),
                                    }
                                }
                            }
                            Some(m) => {
                                let result = &mut self.material_results[m as usize];
                                match offset.operation {
                                    MaterialMorphOp::Multiply => result.apply_multiply(offset, weight),
                                    MaterialMorphOp::Add => result.apply_additive(offset, weight),
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

impl Default for MorphManager {
    fn default() -> Self {
        Self::new()
    }
}
