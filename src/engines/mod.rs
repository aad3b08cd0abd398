//! The three per-monitoring-object aggregation engines: fixed-window merge
//! ([`fwm`]), moving-average limit detection ([`mavg`]), and top-K
//! classification ([`clsf`]) (spec.md [MODULE F], [MODULE G]).

pub mod clsf;
pub mod fwm;
pub mod mavg;
