// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 速度估计 (Speed Estimator)
//!
//! 每个身份保留一段有限长度的世界坐标轨迹。速度取相邻样本逐轴位移绝对值的中位数,
//! 再取欧氏范数, 乘以帧率与单位换算系数。中位数可以抑制单帧检测抖动。

use std::collections::{HashMap, VecDeque};

use crate::geometry::Point;

/// m/s → km/h
pub const MPS_TO_KPH: f32 = 3.6;

#[derive(Debug, Clone)]
pub struct SpeedEstimator {
    trace_length: usize,
    fps: f32,
    unit: f32,
    traces: HashMap<u32, VecDeque<Point>>,
    speeds: HashMap<u32, f32>,
}

impl SpeedEstimator {
    /// `trace_length` 至少为 2, 否则无法求位移
    pub fn new(trace_length: usize, fps: f32, unit: f32) -> Self {
        Self {
            trace_length: trace_length.max(2),
            fps,
            unit,
            traces: HashMap::new(),
            speeds: HashMap::new(),
        }
    }

    /// 追加世界坐标点并重新计算该身份的速度
    pub fn update_trajectory(&mut self, id: u32, world_point: Point) {
        let trace = self.traces.entry(id).or_default();
        trace.push_back(world_point);
        while trace.len() > self.trace_length {
            trace.pop_front();
        }

        if trace.len() < 2 {
            return;
        }

        let mut dx: Vec<f32> = Vec::with_capacity(trace.len() - 1);
        let mut dy: Vec<f32> = Vec::with_capacity(trace.len() - 1);
        for (a, b) in trace.iter().zip(trace.iter().skip(1)) {
            dx.push((b[0] - a[0]).abs());
            dy.push((b[1] - a[1]).abs());
        }

        let ds = median(&mut dx).hypot(median(&mut dy));
        self.speeds.insert(id, ds * self.fps * self.unit);
    }

    /// 当前速度; 无数据时为 0
    pub fn current_speed(&self, id: u32) -> f32 {
        self.speeds.get(&id).copied().unwrap_or(0.0)
    }

    pub fn trace(&self, id: u32) -> Option<&VecDeque<Point>> {
        self.traces.get(&id)
    }

    /// 丢弃已退役身份的轨迹
    pub fn retain(&mut self, alive: &[u32]) {
        self.traces.retain(|id, _| alive.contains(id));
        self.speeds.retain(|id, _| alive.contains(id));
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }
}

/// 中位数 (偶数个取中间两数均值)
fn median(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}
