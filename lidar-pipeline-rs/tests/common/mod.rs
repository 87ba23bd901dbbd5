//! Shared helpers for integration tests.

use std::path::Path;

use las::point::{Classification, Format};
use las::{Builder, Point, Writer};

/// Write a LAS 1.2 point format 0 tile of `(position, class)` points.
pub fn write_tile(path: &Path, points: &[([f64; 3], u8)]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let mut builder = Builder::from((1, 2));
    builder.point_format = Format::new(0).unwrap();
    let mut writer = Writer::from_path(path, builder.into_header().unwrap()).unwrap();
    for &(pos, class) in points {
        writer
            .write_point(Point {
                x: pos[0],
                y: pos[1],
                z: pos[2],
                intensity: 1000,
                return_number: 1,
                number_of_returns: 1,
                classification: Classification::new(class).unwrap(),
                ..Default::default()
            })
            .unwrap();
    }
    writer.close().unwrap();
}

/// A `side x side` grid with 0.5 m spacing, classes in horizontal bands.
pub fn banded_grid(origin: [f64; 2], side: usize) -> Vec<([f64; 3], u8)> {
    let mut points = Vec::with_capacity(side * side);
    for i in 0..side {
        for j in 0..side {
            let class = match j * 3 / side {
                0 => 2,
                1 => 5,
                _ => 6,
            };
            points.push(([origin[0] + i as f64 * 0.5, origin[1] + j as f64 * 0.5, (i % 4) as f64], class));
        }
    }
    points
}

/// Classification codes of a LAS file, in point order.
pub fn read_classes(path: &Path) -> Vec<u8> {
    let mut reader = las::Reader::from_path(path).unwrap();
    reader
        .points()
        .map(|p| u8::from(p.unwrap().classification))
        .collect()
}

/// Positions of a LAS file, in point order.
pub fn read_positions(path: &Path) -> Vec<[f64; 3]> {
    let mut reader = las::Reader::from_path(path).unwrap();
    reader
        .points()
        .map(|p| {
            let p = p.unwrap();
            [p.x, p.y, p.z]
        })
        .collect()
}
