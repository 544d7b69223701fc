//! Madgwick AHRS orientation filter.
//!
//! Fuses gyroscope, accelerometer and (optionally) magnetometer samples
//! into a continuously-updated unit quaternion, readable as-is or as
//! roll/pitch/yaw Euler angles. The caller owns all timing: feed the
//! filter one sample triple per period at the configured sample rate and
//! read the orientation whenever convenient.
//!
//! An all-zero magnetometer triple means "no magnetometer reading"; the
//! filter then falls back to six-axis (gyro + accel) fusion for that step.
//!
//! Reference: Madgwick, S. O. H., "An efficient orientation filter for
//! inertial and inertial/magnetic sensor arrays" (2010),
//! <http://www.x-io.co.uk/open-source-imu-and-ahrs-algorithms/>

#![no_std]

pub mod madgwick;

pub use madgwick::{ImuData, MadgwickFilter, ParamError};
