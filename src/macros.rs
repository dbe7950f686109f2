//! # Internal Macros
//!
//! This module provides internal macros for reducing boilerplate around the
//! packed on-disk headers.
//!
//! ## zerocopy_accessors!
//!
//! Generates getter and setter methods for zerocopy struct fields that use
//! little-endian wrapper types. A single expansion covers every integer
//! width: the wrapper type (`U16`, `U64`, ...) is derived from the native
//! type token by case conversion, so adding a field of a new width needs no
//! macro changes. The node header packs everything else (flag bits, type
//! bytes) by hand.
//!
//! ### Usage
//!
//! ```ignore
//! use zerocopy::little_endian::{U16, U64};
//!
//! #[repr(C)]
//! struct Header {
//!     node_gen: U64,
//!     level: U16,
//! }
//!
//! impl Header {
//!     zerocopy_accessors! {
//!         node_gen: u64,
//!         level: u16,
//!     }
//! }
//!
//! // Generates:
//! // pub fn node_gen(&self) -> u64 { self.node_gen.get() }
//! // pub fn set_node_gen(&mut self, val: u64) { self.node_gen = U64::new(val); }
//! // pub fn level(&self) -> u16 { self.level.get() }
//! // pub fn set_level(&mut self, val: u16) { self.level = U16::new(val); }
//! ```

/// Generates getter and setter methods for zerocopy little-endian fields.
///
/// Each `field: uNN` pair expands to a getter returning the native integer
/// and a `set_` companion wrapping the value back into
/// `zerocopy::little_endian::UNN`.
#[macro_export]
macro_rules! zerocopy_accessors {
    ($($field:ident : $ty:ident),* $(,)?) => {
        $(
            ::paste::paste! {
                #[inline]
                pub fn $field(&self) -> $ty {
                    self.$field.get()
                }

                #[inline]
                pub fn [<set_ $field>](&mut self, val: $ty) {
                    self.$field = ::zerocopy::little_endian::[<$ty:upper>]::new(val);
                }
            }
        )*
    };
}
