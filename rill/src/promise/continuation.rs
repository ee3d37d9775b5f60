use crate::promise::tuple::Tuple;

/// A user callable bound to run when an antecedent promise resolves.
///
/// `Args` is the tuple the antecedent carries. `Marker` disambiguates the
/// two call shapes a closure can have for the same tuple:
///
/// - [`Spread`]: the closure's arity matches the tuple's and it receives the
///   elements unpacked, `f(a, b)`.
/// - [`Packed`]: the closure is unary and receives the whole tuple, `f((a, b))`.
///
/// Each closure implements exactly one of the two for a given `Args`, so the
/// marker is inferred at the call site and the dispatch is fully static; a
/// continuation whose signature fits neither shape fails to compile.
pub trait Continuation<Args, Marker>: Send + 'static {
    type Output: Send + 'static;

    fn invoke(self, args: Args) -> Self::Output;
}

/// Marker: arity-matched continuation receiving unpacked tuple elements.
#[derive(Debug)]
pub struct Spread;

/// Marker: unary continuation receiving the whole tuple.
#[derive(Debug)]
pub struct Packed;

impl<F, R> Continuation<(), Spread> for F
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    type Output = R;

    fn invoke(self, _args: ()) -> R {
        self()
    }
}

macro_rules! impl_spread {
    ($($arg:ident),+) => {
        impl<F, $($arg,)+ R> Continuation<($($arg,)+), Spread> for F
        where
            F: FnOnce($($arg),+) -> R + Send + 'static,
            $($arg: Send + 'static,)+
            R: Send + 'static,
        {
            type Output = R;

            #[allow(non_snake_case)]
            fn invoke(self, args: ($($arg,)+)) -> R {
                let ($($arg,)+) = args;
                self($($arg),+)
            }
        }
    };
}

impl_spread!(A1);
impl_spread!(A1, A2);
impl_spread!(A1, A2, A3);
impl_spread!(A1, A2, A3, A4);

impl<F, T, R> Continuation<T, Packed> for F
where
    T: Tuple,
    F: FnOnce(T) -> R + Send + 'static,
    R: Send + 'static,
{
    type Output = R;

    fn invoke(self, args: T) -> R {
        self(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call<Args, M, F>(f: F, args: Args) -> F::Output
    where
        F: Continuation<Args, M>,
    {
        f.invoke(args)
    }

    #[test]
    fn spread_unpacks_matching_arity() {
        let out = call(|i: i32, s: String| (s.len() as i32) * i, (3, "ab".to_string()));
        assert_eq!(out, 6);
    }

    #[test]
    fn packed_receives_whole_tuple() {
        let out = call(
            |values: (i32, String)| {
                let (i, s) = values;
                (s.len() as i32) * i
            },
            (3, "ab".to_string()),
        );
        assert_eq!(out, 6);
    }

    #[test]
    fn zero_arity_matches_unit() {
        let out = call(|| 41 + 1, ());
        assert_eq!(out, 42);
    }
}
