//! Morph 数据模型
//!
//! 统一的命名 Morph 注册表：顶点/UV/骨骼/材质/组五种，
//! 权重由动作轨道写入，每帧按权重汇总成顶点/骨骼/材质增量。

mod manager;

pub use manager::{MaterialMorphResult, MorphManager};

use glam::{Quat, Vec2, Vec3, Vec4};

/// 低于此权重的 Morph 不参与求值
pub(crate) const MIN_MORPH_WEIGHT: f32 = 0.001;

/// Morph 种类
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MorphKind {
    /// 顶点位置偏移
    Vertex,
    /// 纹理坐标偏移
    Uv,
    /// 骨骼位移/旋转偏移
    Bone,
    /// 材质参数偏移
    Material,
    /// 组合 Morph：按比例转发到成员
    Group,
}

/// 顶点 Morph 偏移
#[derive(Clone, Copy, Debug)]
pub struct VertexMorphOffset {
    pub vertex_index: u32,
    pub offset: Vec3,
}

/// UV Morph 偏移
#[derive(Clone, Copy, Debug)]
pub struct UvMorphOffset {
    pub vertex_index: u32,
    pub offset: Vec2,
}

/// 骨骼 Morph 偏移
#[derive(Clone, Copy, Debug)]
pub struct BoneMorphOffset {
    pub bone_index: u32,
    pub translation: Vec3,
    pub rotation: Quat,
}

/// 材质 Morph 运算方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaterialMorphOp {
    /// 乘算
    Multiply,
    /// 加算
    Add,
}

/// 材质 Morph 偏移
///
/// `material_index` 为 `None` 时作用于全部材质
#[derive(Clone, Copy, Debug)]
pub struct MaterialMorphOffset {
    pub material_index: Option<u32>,
    pub operation: MaterialMorphOp,
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

/// 组 Morph 成员
#[derive(Clone, Copy, Debug)]
pub struct GroupMorphOffset {
    pub morph_index: u32,
    pub influence: f32,
}

/// 命名 Morph
///
/// 只有与 `kind` 对应的偏移表有内容，其余为空。
#[derive(Clone, Debug)]
pub struct Morph {
    pub name: String,
    pub kind: MorphKind,
    /// 当前权重（动作每帧写入）
    pub weight: f32,
    pub vertex_offsets: Vec<VertexMorphOffset>,
    pub uv_offsets: Vec<UvMorphOffset>,
    pub bone_offsets: Vec<BoneMorphOffset>,
    pub material_offsets: Vec<MaterialMorphOffset>,
    pub group_offsets: Vec<GroupMorphOffset>,
}

impl Morph {
    /// 创建空 Morph
    pub fn new(name: impl Into<String>, kind: MorphKind) -> Self {
        Self {
            name: name.into(),
            kind,
            weight: 0.0,
            vertex_offsets: Vec::new(),
            uv_offsets: Vec::new(),
            bone_offsets: Vec::new(),
            material_offsets: Vec::new(),
            group_offsets: Vec::new(),
        }
    }

    /// 重置权重
    #[inline]
    pub fn reset(&mut self) {
        self.weight = 0.0;
    }
}
