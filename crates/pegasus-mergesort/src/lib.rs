#![forbid(unsafe_code)]

//! Mergesort demo project: generate random integer segments on the
//! workers, sort the segments, merge, and dump the result to a file.
//! Exercises every part of the job/task/tasklet contract.

mod dumpres;
mod mergesort;
mod proj;
mod randints;

pub use dumpres::JobDumpres;
pub use mergesort::JobMergesort;
pub use proj::{PROJ_MERGESORT, ProjMergesort, project_factory};
pub use randints::JobRandInts;
