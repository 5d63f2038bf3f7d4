//! ISO 4064 calibration standards: Q-point tables, water density, error math
//!
//! The Q-point parameter table follows ISO 4064-1:2014 / OIML R 49-1 for the
//! three bench sizes (DN15/DN20/DN25) across the legacy accuracy classes
//! (A/B/C) and the R-class system (R80..R200). Eight points per combination:
//!
//! - Q1 minimum, Q2 transitional, Q3 permanent, Q4 overload
//! - Q5..Q8 extended points (lower/upper intermediate sweeps)
//!
//! Lower-zone points carry an MPE of ±5 %, upper-zone points ±2 %. The
//! density table covers 4–40 °C in 1 °C steps at standard atmospheric
//! pressure; lookups interpolate linearly and clamp to the table range.

use std::fmt;

use serde::{Deserialize, Serialize};

// ===============================================================================================
// Identity enums
// ===============================================================================================

/// Nominal bore size of the meter under test.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeterSize {
    #[serde(rename = "DN15")]
    Dn15,
    #[serde(rename = "DN20")]
    Dn20,
    #[serde(rename = "DN25")]
    Dn25,
}

impl MeterSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeterSize::Dn15 => "DN15",
            MeterSize::Dn20 => "DN20",
            MeterSize::Dn25 => "DN25",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DN15" => Some(MeterSize::Dn15),
            "DN20" => Some(MeterSize::Dn20),
            "DN25" => Some(MeterSize::Dn25),
            _ => None,
        }
    }
}

impl fmt::Display for MeterSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metrological accuracy class (legacy A/B/C or R-class).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeterClass {
    A,
    B,
    C,
    R80,
    R100,
    R160,
    R200,
}

impl MeterClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeterClass::A => "A",
            MeterClass::B => "B",
            MeterClass::C => "C",
            MeterClass::R80 => "R80",
            MeterClass::R100 => "R100",
            MeterClass::R160 => "R160",
            MeterClass::R200 => "R200",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "A" => Some(MeterClass::A),
            "B" => Some(MeterClass::B),
            "C" => Some(MeterClass::C),
            "R80" => Some(MeterClass::R80),
            "R100" => Some(MeterClass::R100),
            "R160" => Some(MeterClass::R160),
            "R200" => Some(MeterClass::R200),
            _ => None,
        }
    }
}

impl fmt::Display for MeterClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical Q-point labels, ordered Q1..Q8.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QLabel {
    Q1,
    Q2,
    Q3,
    Q4,
    Q5,
    Q6,
    Q7,
    Q8,
}

impl QLabel {
    pub const ALL: [QLabel; 8] = [
        QLabel::Q1,
        QLabel::Q2,
        QLabel::Q3,
        QLabel::Q4,
        QLabel::Q5,
        QLabel::Q6,
        QLabel::Q7,
        QLabel::Q8,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QLabel::Q1 => "Q1",
            QLabel::Q2 => "Q2",
            QLabel::Q3 => "Q3",
            QLabel::Q4 => "Q4",
            QLabel::Q5 => "Q5",
            QLabel::Q6 => "Q6",
            QLabel::Q7 => "Q7",
            QLabel::Q8 => "Q8",
        }
    }
}

impl fmt::Display for QLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metrological zone: lower (Q1..Q3 region, MPE ±5 %) or upper (±2 %).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Zone {
    Lower,
    Upper,
}

impl Zone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Zone::Lower => "Lower",
            Zone::Upper => "Upper",
        }
    }
}

// ===============================================================================================
// Q-point parameters
// ===============================================================================================

/// Parameters for a single Q-point, resolved from the standards table.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct QPointSpec {
    pub q_point: QLabel,
    pub flow_rate_lph: f64,
    pub test_volume_l: f64,
    pub duration_s: u32,
    pub mpe_pct: f64,
    pub zone: Zone,
}

// Row format: (size, class, q, flow L/h, volume L, duration s, MPE %, zone).
type Row = (MeterSize, MeterClass, QLabel, f64, f64, u32, f64, Zone);

use MeterClass::*;
use MeterSize::*;
use QLabel::*;
use Zone::*;

#[rustfmt::skip]
const STANDARDS: &[Row] = &[
    // --- DN15 Class A (~R40) ---
    (Dn15, A, Q1, 25.0,   2.0,   288, 5.0, Lower),
    (Dn15, A, Q2, 40.0,   4.0,   360, 2.0, Upper),
    (Dn15, A, Q3, 100.0,  10.0,  360, 2.0, Upper),
    (Dn15, A, Q4, 1600.0, 100.0, 225, 2.0, Upper),
    (Dn15, A, Q5, 12.5,   1.0,   288, 5.0, Lower),
    (Dn15, A, Q6, 31.25,  3.0,   346, 5.0, Lower),
    (Dn15, A, Q7, 50.0,   5.0,   360, 2.0, Upper),
    (Dn15, A, Q8, 2000.0, 120.0, 216, 2.0, Upper),
    // --- DN15 Class B (~R100) ---
    (Dn15, B, Q1, 10.0,   1.0,   360, 5.0, Lower),
    (Dn15, B, Q2, 16.0,   1.6,   360, 2.0, Upper),
    (Dn15, B, Q3, 100.0,  10.0,  360, 2.0, Upper),
    (Dn15, B, Q4, 1600.0, 100.0, 225, 2.0, Upper),
    (Dn15, B, Q5, 5.0,    0.5,   360, 5.0, Lower),
    (Dn15, B, Q6, 12.5,   1.25,  360, 5.0, Lower),
    (Dn15, B, Q7, 50.0,   5.0,   360, 2.0, Upper),
    (Dn15, B, Q8, 2000.0, 120.0, 216, 2.0, Upper),
    // --- DN15 Class C (~R315) ---
    (Dn15, C, Q1, 3.175,  0.25,  284, 5.0, Lower),
    (Dn15, C, Q2, 5.0,    0.5,   360, 2.0, Upper),
    (Dn15, C, Q3, 100.0,  10.0,  360, 2.0, Upper),
    (Dn15, C, Q4, 1600.0, 100.0, 225, 2.0, Upper),
    (Dn15, C, Q5, 1.6,    0.15,  338, 5.0, Lower),
    (Dn15, C, Q6, 4.0,    0.4,   360, 5.0, Lower),
    (Dn15, C, Q7, 50.0,   5.0,   360, 2.0, Upper),
    (Dn15, C, Q8, 2000.0, 120.0, 216, 2.0, Upper),
    // --- DN15 R80 ---
    (Dn15, R80, Q1, 12.5,   1.0,   288, 5.0, Lower),
    (Dn15, R80, Q2, 20.0,   2.0,   360, 2.0, Upper),
    (Dn15, R80, Q3, 100.0,  10.0,  360, 2.0, Upper),
    (Dn15, R80, Q4, 1600.0, 100.0, 225, 2.0, Upper),
    (Dn15, R80, Q5, 6.25,   0.5,   288, 5.0, Lower),
    (Dn15, R80, Q6, 16.0,   1.6,   360, 5.0, Lower),
    (Dn15, R80, Q7, 50.0,   5.0,   360, 2.0, Upper),
    (Dn15, R80, Q8, 2000.0, 120.0, 216, 2.0, Upper),
    // --- DN15 R100 ---
    (Dn15, R100, Q1, 10.0,   1.0,   360, 5.0, Lower),
    (Dn15, R100, Q2, 16.0,   1.6,   360, 2.0, Upper),
    (Dn15, R100, Q3, 100.0,  10.0,  360, 2.0, Upper),
    (Dn15, R100, Q4, 1600.0, 100.0, 225, 2.0, Upper),
    (Dn15, R100, Q5, 5.0,    0.5,   360, 5.0, Lower),
    (Dn15, R100, Q6, 12.5,   1.25,  360, 5.0, Lower),
    (Dn15, R100, Q7, 50.0,   5.0,   360, 2.0, Upper),
    (Dn15, R100, Q8, 2000.0, 120.0, 216, 2.0, Upper),
    // --- DN15 R160 ---
    (Dn15, R160, Q1, 6.25,   0.5,   288, 5.0, Lower),
    (Dn15, R160, Q2, 10.0,   1.0,   360, 2.0, Upper),
    (Dn15, R160, Q3, 100.0,  10.0,  360, 2.0, Upper),
    (Dn15, R160, Q4, 1600.0, 100.0, 225, 2.0, Upper),
    (Dn15, R160, Q5, 3.125,  0.25,  288, 5.0, Lower),
    (Dn15, R160, Q6, 8.0,    0.8,   360, 5.0, Lower),
    (Dn15, R160, Q7, 50.0,   5.0,   360, 2.0, Upper),
    (Dn15, R160, Q8, 2000.0, 120.0, 216, 2.0, Upper),
    // --- DN15 R200 ---
    (Dn15, R200, Q1, 5.0,    0.4,   288, 5.0, Lower),
    (Dn15, R200, Q2, 8.0,    0.8,   360, 2.0, Upper),
    (Dn15, R200, Q3, 100.0,  10.0,  360, 2.0, Upper),
    (Dn15, R200, Q4, 1600.0, 100.0, 225, 2.0, Upper),
    (Dn15, R200, Q5, 2.5,    0.2,   288, 5.0, Lower),
    (Dn15, R200, Q6, 6.4,    0.64,  360, 5.0, Lower),
    (Dn15, R200, Q7, 50.0,   5.0,   360, 2.0, Upper),
    (Dn15, R200, Q8, 2000.0, 120.0, 216, 2.0, Upper),
    // --- DN20 Class A (~R40) ---
    (Dn20, A, Q1, 50.0,   4.0,   288, 5.0, Lower),
    (Dn20, A, Q2, 80.0,   8.0,   360, 2.0, Upper),
    (Dn20, A, Q3, 200.0,  20.0,  360, 2.0, Upper),
    (Dn20, A, Q4, 3200.0, 200.0, 225, 2.0, Upper),
    (Dn20, A, Q5, 25.0,   2.0,   288, 5.0, Lower),
    (Dn20, A, Q6, 62.5,   6.0,   346, 5.0, Lower),
    (Dn20, A, Q7, 100.0,  10.0,  360, 2.0, Upper),
    (Dn20, A, Q8, 4000.0, 160.0, 144, 2.0, Upper),
    // --- DN20 Class B (~R100) ---
    (Dn20, B, Q1, 20.0,   2.0,   360, 5.0, Lower),
    (Dn20, B, Q2, 32.0,   3.2,   360, 2.0, Upper),
    (Dn20, B, Q3, 200.0,  20.0,  360, 2.0, Upper),
    (Dn20, B, Q4, 3200.0, 200.0, 225, 2.0, Upper),
    (Dn20, B, Q5, 10.0,   1.0,   360, 5.0, Lower),
    (Dn20, B, Q6, 25.0,   2.5,   360, 5.0, Lower),
    (Dn20, B, Q7, 100.0,  10.0,  360, 2.0, Upper),
    (Dn20, B, Q8, 4000.0, 160.0, 144, 2.0, Upper),
    // --- DN20 Class C (~R315) ---
    (Dn20, C, Q1, 6.35,   0.5,   284, 5.0, Lower),
    (Dn20, C, Q2, 10.0,   1.0,   360, 2.0, Upper),
    (Dn20, C, Q3, 200.0,  20.0,  360, 2.0, Upper),
    (Dn20, C, Q4, 3200.0, 200.0, 225, 2.0, Upper),
    (Dn20, C, Q5, 3.175,  0.25,  284, 5.0, Lower),
    (Dn20, C, Q6, 8.0,    0.8,   360, 5.0, Lower),
    (Dn20, C, Q7, 100.0,  10.0,  360, 2.0, Upper),
    (Dn20, C, Q8, 4000.0, 160.0, 144, 2.0, Upper),
    // --- DN20 R80 ---
    (Dn20, R80, Q1, 25.0,   2.0,   288, 5.0, Lower),
    (Dn20, R80, Q2, 40.0,   4.0,   360, 2.0, Upper),
    (Dn20, R80, Q3, 200.0,  20.0,  360, 2.0, Upper),
    (Dn20, R80, Q4, 3200.0, 200.0, 225, 2.0, Upper),
    (Dn20, R80, Q5, 12.5,   1.0,   288, 5.0, Lower),
    (Dn20, R80, Q6, 32.0,   3.2,   360, 5.0, Lower),
    (Dn20, R80, Q7, 100.0,  10.0,  360, 2.0, Upper),
    (Dn20, R80, Q8, 4000.0, 160.0, 144, 2.0, Upper),
    // --- DN20 R100 ---
    (Dn20, R100, Q1, 20.0,   2.0,   360, 5.0, Lower),
    (Dn20, R100, Q2, 32.0,   3.2,   360, 2.0, Upper),
    (Dn20, R100, Q3, 200.0,  20.0,  360, 2.0, Upper),
    (Dn20, R100, Q4, 3200.0, 200.0, 225, 2.0, Upper),
    (Dn20, R100, Q5, 10.0,   1.0,   360, 5.0, Lower),
    (Dn20, R100, Q6, 25.0,   2.5,   360, 5.0, Lower),
    (Dn20, R100, Q7, 100.0,  10.0,  360, 2.0, Upper),
    (Dn20, R100, Q8, 4000.0, 160.0, 144, 2.0, Upper),
    // --- DN20 R160 ---
    (Dn20, R160, Q1, 12.5,   1.0,   288, 5.0, Lower),
    (Dn20, R160, Q2, 20.0,   2.0,   360, 2.0, Upper),
    (Dn20, R160, Q3, 200.0,  20.0,  360, 2.0, Upper),
    (Dn20, R160, Q4, 3200.0, 200.0, 225, 2.0, Upper),
    (Dn20, R160, Q5, 6.25,   0.5,   288, 5.0, Lower),
    (Dn20, R160, Q6, 16.0,   1.6,   360, 5.0, Lower),
    (Dn20, R160, Q7, 100.0,  10.0,  360, 2.0, Upper),
    (Dn20, R160, Q8, 4000.0, 160.0, 144, 2.0, Upper),
    // --- DN20 R200 ---
    (Dn20, R200, Q1, 10.0,   0.8,   288, 5.0, Lower),
    (Dn20, R200, Q2, 16.0,   1.6,   360, 2.0, Upper),
    (Dn20, R200, Q3, 200.0,  20.0,  360, 2.0, Upper),
    (Dn20, R200, Q4, 3200.0, 200.0, 225, 2.0, Upper),
    (Dn20, R200, Q5, 5.0,    0.4,   288, 5.0, Lower),
    (Dn20, R200, Q6, 12.8,   1.28,  360, 5.0, Lower),
    (Dn20, R200, Q7, 100.0,  10.0,  360, 2.0, Upper),
    (Dn20, R200, Q8, 4000.0, 160.0, 144, 2.0, Upper),
    // --- DN25 Class A (~R40) ---
    (Dn25, A, Q1, 78.125, 6.0,   277, 5.0, Lower),
    (Dn25, A, Q2, 125.0,  12.0,  346, 2.0, Upper),
    (Dn25, A, Q3, 312.5,  30.0,  346, 2.0, Upper),
    (Dn25, A, Q4, 5000.0, 160.0, 115, 2.0, Upper),
    (Dn25, A, Q5, 39.0,   3.0,   277, 5.0, Lower),
    (Dn25, A, Q6, 100.0,  10.0,  360, 5.0, Lower),
    (Dn25, A, Q7, 156.25, 15.0,  346, 2.0, Upper),
    (Dn25, A, Q8, 6250.0, 180.0, 104, 2.0, Upper),
    // --- DN25 Class B (~R100) ---
    (Dn25, B, Q1, 31.25,  3.0,   346, 5.0, Lower),
    (Dn25, B, Q2, 50.0,   5.0,   360, 2.0, Upper),
    (Dn25, B, Q3, 312.5,  30.0,  346, 2.0, Upper),
    (Dn25, B, Q4, 5000.0, 160.0, 115, 2.0, Upper),
    (Dn25, B, Q5, 15.625, 1.5,   346, 5.0, Lower),
    (Dn25, B, Q6, 40.0,   4.0,   360, 5.0, Lower),
    (Dn25, B, Q7, 156.25, 15.0,  346, 2.0, Upper),
    (Dn25, B, Q8, 6250.0, 180.0, 104, 2.0, Upper),
    // --- DN25 Class C (~R315) ---
    (Dn25, C, Q1, 9.92,   0.75,  272, 5.0, Lower),
    (Dn25, C, Q2, 15.625, 1.5,   346, 2.0, Upper),
    (Dn25, C, Q3, 312.5,  30.0,  346, 2.0, Upper),
    (Dn25, C, Q4, 5000.0, 160.0, 115, 2.0, Upper),
    (Dn25, C, Q5, 5.0,    0.4,   288, 5.0, Lower),
    (Dn25, C, Q6, 12.5,   1.25,  360, 5.0, Lower),
    (Dn25, C, Q7, 156.25, 15.0,  346, 2.0, Upper),
    (Dn25, C, Q8, 6250.0, 180.0, 104, 2.0, Upper),
    // --- DN25 R80 ---
    (Dn25, R80, Q1, 39.0,   3.0,   277, 5.0, Lower),
    (Dn25, R80, Q2, 62.5,   6.0,   346, 2.0, Upper),
    (Dn25, R80, Q3, 312.5,  30.0,  346, 2.0, Upper),
    (Dn25, R80, Q4, 5000.0, 160.0, 115, 2.0, Upper),
    (Dn25, R80, Q5, 19.5,   1.5,   277, 5.0, Lower),
    (Dn25, R80, Q6, 50.0,   5.0,   360, 5.0, Lower),
    (Dn25, R80, Q7, 156.25, 15.0,  346, 2.0, Upper),
    (Dn25, R80, Q8, 6250.0, 180.0, 104, 2.0, Upper),
    // --- DN25 R100 ---
    (Dn25, R100, Q1, 31.25,  3.0,   346, 5.0, Lower),
    (Dn25, R100, Q2, 50.0,   5.0,   360, 2.0, Upper),
    (Dn25, R100, Q3, 312.5,  30.0,  346, 2.0, Upper),
    (Dn25, R100, Q4, 5000.0, 160.0, 115, 2.0, Upper),
    (Dn25, R100, Q5, 15.625, 1.5,   346, 5.0, Lower),
    (Dn25, R100, Q6, 40.0,   4.0,   360, 5.0, Lower),
    (Dn25, R100, Q7, 156.25, 15.0,  346, 2.0, Upper),
    (Dn25, R100, Q8, 6250.0, 180.0, 104, 2.0, Upper),
    // --- DN25 R160 ---
    (Dn25, R160, Q1, 19.5,   1.5,   277, 5.0, Lower),
    (Dn25, R160, Q2, 31.25,  3.0,   346, 2.0, Upper),
    (Dn25, R160, Q3, 312.5,  30.0,  346, 2.0, Upper),
    (Dn25, R160, Q4, 5000.0, 160.0, 115, 2.0, Upper),
    (Dn25, R160, Q5, 9.75,   0.75,  277, 5.0, Lower),
    (Dn25, R160, Q6, 25.0,   2.5,   360, 5.0, Lower),
    (Dn25, R160, Q7, 156.25, 15.0,  346, 2.0, Upper),
    (Dn25, R160, Q8, 6250.0, 180.0, 104, 2.0, Upper),
    // --- DN25 R200 ---
    (Dn25, R200, Q1, 15.625, 1.2,   277, 5.0, Lower),
    (Dn25, R200, Q2, 25.0,   2.5,   360, 2.0, Upper),
    (Dn25, R200, Q3, 312.5,  30.0,  346, 2.0, Upper),
    (Dn25, R200, Q4, 5000.0, 160.0, 115, 2.0, Upper),
    (Dn25, R200, Q5, 7.8,    0.6,   277, 5.0, Lower),
    (Dn25, R200, Q6, 20.0,   2.0,   360, 5.0, Lower),
    (Dn25, R200, Q7, 156.25, 15.0,  346, 2.0, Upper),
    (Dn25, R200, Q8, 6250.0, 180.0, 104, 2.0, Upper),
];

/// Resolve the ordered Q1..Q8 parameter list for a (size, class) pair.
///
/// Returns an empty vec only if the combination is missing from the table,
/// which callers treat as a pre-check failure.
pub fn q_points_for(size: MeterSize, class: MeterClass) -> Vec<QPointSpec> {
    let mut points: Vec<QPointSpec> = STANDARDS
        .iter()
        .filter(|(s, c, ..)| *s == size && *c == class)
        .map(|&(_, _, q, flow, vol, dur, mpe, zone)| QPointSpec {
            q_point: q,
            flow_rate_lph: flow,
            test_volume_l: vol,
            duration_s: dur,
            mpe_pct: mpe,
            zone,
        })
        .collect();
    points.sort_by_key(|p| p.q_point);
    points
}

/// Look up a single Q-point for a (size, class) pair.
pub fn q_point_for(size: MeterSize, class: MeterClass, q: QLabel) -> Option<QPointSpec> {
    q_points_for(size, class).into_iter().find(|p| p.q_point == q)
}

// ===============================================================================================
// Water density
// ===============================================================================================

// Density of air-free water (kg/L) at 4..=40 degC, standard atmospheric
// pressure. Index 0 is 4 degC.
#[rustfmt::skip]
const DENSITY_TABLE: [f64; 37] = [
    0.99997, 0.99996, 0.99994, 0.99990, 0.99985, 0.99978, 0.99970,
    0.99961, 0.99950, 0.99938, 0.99924, 0.99910, 0.99894, 0.99877,
    0.99860, 0.99841, 0.99820, 0.99799, 0.99777, 0.99754, 0.99730,
    0.99705, 0.99678, 0.99651, 0.99623, 0.99594, 0.99565, 0.99534,
    0.99503, 0.99470, 0.99437, 0.99403, 0.99368, 0.99333, 0.99297,
    0.99259, 0.99222,
];

/// Water density in kg/L at the given temperature.
///
/// Linear interpolation between the 1 °C table steps; the input is clamped
/// to the 4–40 °C table range.
pub fn water_density(temperature_c: f64) -> f64 {
    let t = temperature_c.clamp(4.0, 40.0);
    let lower = t.floor() as usize;
    let idx = lower - 4;
    if lower >= 40 {
        return DENSITY_TABLE[36];
    }
    let d_lower = DENSITY_TABLE[idx];
    let d_upper = DENSITY_TABLE[idx + 1];
    d_lower + (d_upper - d_lower) * (t - lower as f64)
}

// ===============================================================================================
// Error math
// ===============================================================================================

/// Meter indication error in percent: (DUT − reference) / reference × 100.
pub fn meter_error_pct(ref_volume_l: f64, dut_volume_l: f64) -> f64 {
    if ref_volume_l == 0.0 {
        return 0.0;
    }
    (dut_volume_l - ref_volume_l) / ref_volume_l * 100.0
}

/// Whether an error lies inside the signed MPE envelope.
pub fn within_mpe(error_pct: f64, mpe_pct: f64) -> bool {
    error_pct.abs() <= mpe_pct.abs()
}
