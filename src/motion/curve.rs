//! 插值缓动曲线
//!
//! 动作关键帧的非线性插值由两个贝塞尔控制点定义。
//! 装配期解一次三次方程生成 257 项查表，播放期只做查表加线性内插，
//! 避免每帧重解三次根。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// 查表分辨率（表内存 TABLE_SIZE + 1 个值）
pub const EASE_TABLE_SIZE: usize = 256;

/// 贝塞尔控制点参数（[0, 127] 量化，与动作文件一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CurveSpec {
    /// 控制点 1 (x, y)
    pub c0: [u8; 2],
    /// 控制点 2 (x, y)
    pub c1: [u8; 2],
}

impl CurveSpec {
    /// 对角线（严格线性）
    pub const LINEAR: Self = Self {
        c0: [20, 20],
        c1: [107, 107],
    };

    /// 控制点都在对角线上时退化为线性，无需建表
    #[inline]
    pub fn is_linear(&self) -> bool {
        self.c0[0] == self.c0[1] && self.c1[0] == self.c1[1]
    }
}

// ============================================================================
// 三次贝塞尔求值
// ============================================================================

/// 一维三次贝塞尔：端点固定 (0,0)/(1,1)，p1/p2 为控制点坐标分量
#[inline]
fn ipfunc(t: f32, p1: f32, p2: f32) -> f32 {
    (1.0 + 3.0 * p1 - 3.0 * p2) * t * t * t + (3.0 * p2 - 6.0 * p1) * t * t + 3.0 * p1 * t
}

/// ipfunc 对 t 的导数
#[inline]
fn ipfuncd(t: f32, p1: f32, p2: f32) -> f32 {
    (3.0 + 9.0 * p1 - 9.0 * p2) * t * t + (6.0 * p2 - 12.0 * p1) * t + 3.0 * p1
}

/// 解 x(t) = x 的 t：先牛顿迭代，导数过小或不收敛时退回二分
fn solve_x(x: f32, x1: f32, x2: f32) -> f32 {
    let mut t = x;
    for _ in 0..8 {
        let v = ipfunc(t, x1, x2) - x;
        if v.abs() < 0.0001 {
            return t;
        }
        let d = ipfuncd(t, x1, x2);
        if d < 1e-6 {
            break;
        }
        t -= v / d;
    }

    let mut t0 = 0.0_f32;
    let mut t1 = 1.0_f32;
    let mut t2 = x.clamp(0.0, 1.0);
    while t0 < t1 {
        let v = ipfunc(t2, x1, x2);
        if (v - x).abs() < 0.0001 {
            return t2;
        }
        if x > v {
            t0 = t2;
        } else {
            t1 = t2;
        }
        t2 = (t1 - t0) * 0.5 + t0;
    }
    t2
}

// ============================================================================
// 缓动查表
// ============================================================================

/// 预计算的缓动查表
///
/// 装配期生成一次，之后只读，可被任意多个播放器共享。
#[derive(Debug, Clone, PartialEq)]
pub struct EaseCurve {
    spec: CurveSpec,
    table: Box<[f32; EASE_TABLE_SIZE + 1]>,
}

impl EaseCurve {
    /// 由量化控制点建表
    pub fn from_spec(spec: CurveSpec) -> Self {
        let x1 = spec.c0[0] as f32 / 127.0;
        let y1 = spec.c0[1] as f32 / 127.0;
        let x2 = spec.c1[0] as f32 / 127.0;
        let y2 = spec.c1[1] as f32 / 127.0;

        let mut table = Box::new([0.0_f32; EASE_TABLE_SIZE + 1]);
        for d in 0..EASE_TABLE_SIZE {
            let inval = d as f32 / EASE_TABLE_SIZE as f32;
            let t = solve_x(inval, x1, x2);
            table[d] = ipfunc(t, y1, y2);
        }
        table[EASE_TABLE_SIZE] = 1.0;

        Self { spec, table }
    }

    /// 控制点参数
    #[inline]
    pub fn spec(&self) -> CurveSpec {
        self.spec
    }

    /// 按线性权重 w ∈ [0, 1] 查缓动值：
    /// 取 floor(w × 256) 的表项，与下一项按小数部分线性内插
    #[inline]
    pub fn value(&self, w: f32) -> f32 {
        let scaled = w.clamp(0.0, 1.0) * EASE_TABLE_SIZE as f32;
        let idx = (scaled as usize).min(EASE_TABLE_SIZE - 1);
        self.table[idx] + (self.table[idx + 1] - self.table[idx]) * (scaled - idx as f32)
    }
}

// ============================================================================
// 曲线缓存
// ============================================================================

/// 缓动曲线缓存
///
/// 同一动作文件里大量关键帧重复使用相同控制点，建表一次即可共享。
#[derive(Debug, Default)]
pub struct EaseCache(RwLock<HashMap<CurveSpec, Arc<EaseCurve>>>);

impl EaseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取缓存曲线，没有则建表并放入缓存
    pub fn get_or_build(&self, spec: CurveSpec) -> Arc<EaseCurve> {
        if let Ok(map) = self.0.read() {
            if let Some(curve) = map.get(&spec) {
                return curve.clone();
            }
        }
        match self.0.write() {
            Ok(mut map) => map
                .entry(spec)
                .or_insert_with(|| Arc::new(EaseCurve::from_spec(spec)))
                .clone(),
            Err(_) => Arc::new(EaseCurve::from_spec(spec)),
        }
    }
}

impl Clone for EaseCache {
    fn clone(&self) -> Self {
        // 克隆时建新的空缓存
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_are_exact() {
        let curve = EaseCurve::from_spec(CurveSpec {
            c0: [40, 10],
            c1: [80, 120],
        });
        assert!(curve.value(0.0).abs() < 1e-4);
        assert!((curve.value(1.0) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn diagonal_control_points_approximate_identity() {
        let curve = EaseCurve::from_spec(CurveSpec {
            c0: [32, 32],
            c1: [96, 96],
        });
        for i in 0..=10 {
            let w = i as f32 / 10.0;
            assert!((curve.value(w) - w).abs() < 0.01, "w={w}");
        }
    }

    #[test]
    fn ease_in_is_slow_at_start() {
        let curve = EaseCurve::from_spec(CurveSpec {
            c0: [53, 0],
            c1: [127, 127],
        });
        assert!(curve.value(0.25) < 0.25);
    }

    #[test]
    fn table_is_monotone_for_valid_controls() {
        let curve = EaseCurve::from_spec(CurveSpec {
            c0: [10, 100],
            c1: [100, 10],
        });
        let mut prev = curve.value(0.0);
        for i in 1..=64 {
            let v = curve.value(i as f32 / 64.0);
            assert!(v >= prev - 1e-3);
            prev = v;
        }
    }

    #[test]
    fn linear_detection() {
        assert!(CurveSpec::LINEAR.is_linear());
        assert!(CurveSpec { c0: [5, 5], c1: [90, 90] }.is_linear());
        assert!(!CurveSpec { c0: [5, 6], c1: [90, 90] }.is_linear());
    }

    #[test]
    fn cache_shares_identical_specs() {
        let cache = EaseCache::new();
        let spec = CurveSpec {
            c0: [32, 16],
            c1: [96, 110],
        };
        let a = cache.get_or_build(spec);
        let b = cache.get_or_build(spec);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
