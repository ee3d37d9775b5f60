/// Marker for the value shapes a promise can carry: unit, a single value, or
/// a tuple of up to four values.
///
/// Everything crossing a promise boundary may move between threads, hence
/// the `Send + 'static` supertrait.
pub trait Tuple: Send + 'static {}

impl Tuple for () {}

macro_rules! impl_tuple {
    ($($ty:ident),+) => {
        impl<$($ty: Send + 'static),+> Tuple for ($($ty,)+) {}
    };
}

impl_tuple!(T1);
impl_tuple!(T1, T2);
impl_tuple!(T1, T2, T3);
impl_tuple!(T1, T2, T3, T4);
