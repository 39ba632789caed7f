//! # Internal Macros
//!
//! This module provides internal macros for reducing boilerplate.
//!
//! ## zerocopy_accessors!
//!
//! Generates getter and setter methods for zerocopy struct fields that use
//! little-endian wrapper types (U16, U32, U64).
//!
//! ### Usage
//!
//! ```ignore
//! use zerocopy::little_endian::{U16, U64};
//!
//! #[repr(C)]
//! struct Header {
//!     n_recs: U16,
//!     index_id: U64,
//! }
//!
//! impl Header {
//!     zerocopy_accessors! {
//!         n_recs: u16,
//!         index_id: u64,
//!     }
//! }
//!
//! // Generates:
//! // pub fn n_recs(&self) -> u16 { self.n_recs.get() }
//! // pub fn set_n_recs(&mut self, val: u16) { self.n_recs = U16::new(val); }
//! // pub fn index_id(&self) -> u64 { self.index_id.get() }
//! // pub fn set_index_id(&mut self, val: u64) { self.index_id = U64::new(val); }
//! ```

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u16) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u16 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u16) {
                self.$field = ::zerocopy::little_endian::U16::new(val);
            }
        }
    };
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::little_endian::U32::new(val);
            }
        }
    };
    (@impl $field:ident, u64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u64) {
                self.$field = ::zerocopy::little_endian::U64::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}
