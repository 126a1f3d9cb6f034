pub use enclose::*;

#[macro_export]
macro_rules! provider {
    (( $($d_tt:tt)* ) $ctx:ident => $($b:tt)*) => {
        $crate::Provider::new($crate::macros::enclose!(($( $d_tt )*) move |$ctx: &$crate::Context| { $($b)* }))
    };
    ($ctx:ident => $($b:tt)*) => {
        $crate::Provider::new(move |$ctx: &$crate::Context| { $($b)* })
    };
}

#[macro_export]
macro_rules! future_provider {
    (( $($d_tt:tt)* ) $ctx:ident => $($b:tt)*) => {
        $crate::FutureProvider::new($crate::macros::enclose!(($( $d_tt )*) move |$ctx: $crate::Context| { $($b)* }))
    };
    ($ctx:ident => $($b:tt)*) => {
        $crate::FutureProvider::new(move |$ctx: $crate::Context| { $($b)* })
    };
}
