//! Contains all of the types needed to specify options to the various operations and types in the
//! driver.

macro_rules! resolve_options {
    ($obj:expr, $opts:expr, [$( $field:ident ),+] ) => {
        $(
            if let Some(option) = $obj.$field() {
                let options = $opts.get_or_insert_with(Default::default);
                if options.$field.is_none() {
                    options.$field = Some(option.clone());
                }
            }
        )+
    };
}

macro_rules! merge_options {
    ($defaults:expr, $options:expr, [$( $field:ident ),+] ) => {
        $(
            if let Some(ref option) = $defaults.$field {
                if !$options.$field.is_some() {
                    $options.$field = Some(option.clone());
                }
            }
        )+
    };
}

pub use crate::{
    change_stream::options::*,
    client::{
        auth::{AuthMechanism, Credential},
        options::*,
    },
    coll::options::*,
    compression::Compressor,
    concern::*,
    db::options::*,
    selection_criteria::*,
};
