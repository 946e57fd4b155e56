/// Provides a constant default value.
///
/// This is similar to [`ConstDefault`] but can be implemented for types from
/// other crates that do not provide one.
///
/// [`ConstDefault`]: const_default1::ConstDefault
pub trait Init {
    /// `Self`'s default value.
    const INIT: Self;
}

impl Init for () {
    const INIT: Self = ();
}
