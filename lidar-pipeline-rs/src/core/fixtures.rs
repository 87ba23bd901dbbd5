//! Synthetic LAS files for tests.

use std::path::Path;

use las::point::{Classification, Format};
use las::{Builder, Point, Writer};

use super::loaders::Position;

/// One point of a synthetic tile.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TestPoint {
    pub pos: Position,
    pub class: u8,
    pub intensity: u16,
    pub return_number: u8,
    pub number_of_returns: u8,
}

impl TestPoint {
    pub fn new(pos: Position, class: u8) -> Self {
        Self {
            pos,
            class,
            intensity: 0,
            return_number: 1,
            number_of_returns: 1,
        }
    }

    pub fn with_intensity(mut self, intensity: u16) -> Self {
        self.intensity = intensity;
        self
    }

    pub fn with_returns(mut self, return_number: u8, number_of_returns: u8) -> Self {
        self.return_number = return_number;
        self.number_of_returns = number_of_returns;
        self
    }
}

/// Write a LAS 1.2, point format 0 file containing `points`.
pub(crate) fn write_test_las(path: &Path, points: &[TestPoint]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }

    let mut builder = Builder::from((1, 2));
    builder.point_format = Format::new(0).unwrap();
    let header = builder.into_header().unwrap();

    let mut writer = Writer::from_path(path, header).unwrap();
    for p in points {
        writer
            .write_point(Point {
                x: p.pos[0],
                y: p.pos[1],
                z: p.pos[2],
                intensity: p.intensity,
                return_number: p.return_number,
                number_of_returns: p.number_of_returns,
                classification: Classification::new(p.class).unwrap(),
                ..Default::default()
            })
            .unwrap();
    }
    writer.close().unwrap();
}

/// A square grid of `side * side` points spaced one meter apart, starting at
/// `origin`, with labels produced by `label`.
pub(crate) fn grid_points(origin: [f64; 2], side: usize, label: impl Fn(usize, usize) -> u8) -> Vec<TestPoint> {
    let mut points = Vec::with_capacity(side * side);
    for i in 0..side {
        for j in 0..side {
            points.push(TestPoint::new(
                [origin[0] + i as f64, origin[1] + j as f64, (i + j) as f64 * 0.1],
                label(i, j),
            ));
        }
    }
    points
}
