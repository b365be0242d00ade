//! A small library to parse command-line and environmental flags.
//!
//! Flags are grouped by a marker type (see [`define_flag!`]). Every group owns its own
//! table so that independent components can parse their flags separately, e.g.
//! `--verify-lock-stack=false` or `VERIFY_LOCK_STACK=false`.

use std::{any::TypeId, borrow::Cow, marker::PhantomData};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FlagType {
    Boolean,
    Usize,
}

#[derive(Clone, Copy)]
enum FlagValue {
    Bool(*mut bool),
    Usize(*mut usize),
}

impl FlagValue {
    fn typ(&self) -> FlagType {
        match self {
            Self::Bool(_) => FlagType::Boolean,
            Self::Usize(_) => FlagType::Usize,
        }
    }
}

struct Flag {
    comment: &'static str,
    name: &'static str,
    value: FlagValue,
    is_set: bool,
}

// Flag storage is a `static` owned by the defining module; the table only
// holds its address and every write goes through the table lock.
unsafe impl Send for Flag {}

struct Flags {
    flags: Vec<Flag>,
    initialized: bool,
}

struct Node {
    type_id: TypeId,
    flags: Flags,
}

static FLAGS_MAP: Mutex<Vec<Node>> = Mutex::new(Vec::new());

#[derive(Debug)]
pub enum FlagError {
    FlagNotFound(String),
    FlagsAlreadyInitialized(&'static str),
    NoFlags(&'static str),
}

impl std::fmt::Display for FlagError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FlagNotFound(name) => write!(f, "unknown flag: {}", name),
            Self::FlagsAlreadyInitialized(group) => {
                write!(f, "flags of {} were already parsed", group)
            }
            Self::NoFlags(group) => write!(f, "no flags registered for {}", group),
        }
    }
}

impl std::error::Error for FlagError {}

pub struct FlagsOf<T>(PhantomData<T>);

impl<T: 'static> FlagsOf<T> {
    fn with<U>(create: bool, f: impl FnOnce(&mut Flags) -> U) -> Option<U> {
        let mut map = FLAGS_MAP.lock();
        let key = TypeId::of::<T>();

        if let Some(node) = map.iter_mut().find(|node| node.type_id == key) {
            return Some(f(&mut node.flags));
        }

        if !create {
            return None;
        }

        map.push(Node {
            type_id: key,
            flags: Flags {
                flags: Vec::new(),
                initialized: false,
            },
        });
        map.last_mut().map(|node| f(&mut node.flags))
    }

    pub fn is_set(name: &str) -> bool {
        Self::with(false, |flags| {
            flags
                .flags
                .iter()
                .any(|flag| flag.name == name && flag.is_set)
        })
        .unwrap_or(false)
    }

    /// Name and description of every flag in this group, in registration order.
    pub fn describe() -> Vec<(&'static str, &'static str)> {
        Self::with(false, |flags| {
            flags
                .flags
                .iter()
                .map(|flag| (flag.name, flag.comment))
                .collect()
        })
        .unwrap_or_default()
    }

    fn add_flag(flag: Flag) {
        Self::with(true, |flags| {
            if !flags.flags.iter().any(|f| f.name == flag.name) {
                flags.flags.push(flag);
            }
        });
    }

    fn set_flag_from_string(flag: &mut Flag, argument: &str) -> bool {
        match flag.value {
            FlagValue::Bool(ptr) => {
                let value = match argument {
                    "true" => true,
                    "false" => false,
                    _ => return false,
                };
                unsafe {
                    ptr.write(value);
                }
            }

            FlagValue::Usize(ptr) => {
                let (digits, base) = match argument.strip_prefix("0x") {
                    Some(hex) => (hex, 16),
                    None => (argument, 10),
                };

                match usize::from_str_radix(digits, base) {
                    Ok(value) => unsafe {
                        ptr.write(value);
                    },
                    Err(_) => return false,
                }
            }
        }

        flag.is_set = true;
        true
    }

    fn apply(name: &str, argument: &str) -> Result<(), FlagError> {
        Self::with(false, |flags| {
            let Some(flag) = flags.flags.iter_mut().find(|flag| flag.name == name) else {
                return Err(FlagError::FlagNotFound(name.to_owned()));
            };

            if !Self::set_flag_from_string(flag, argument) {
                log::warn!(
                    target: "vmkit::flags",
                    "Ignoring flag: {} is an invalid value for {:?} flag {}",
                    argument,
                    flag.value.typ(),
                    name
                );
            }

            Ok(())
        })
        .unwrap_or_else(|| Err(FlagError::NoFlags(std::any::type_name::<T>())))
    }

    fn parse(option: &str) -> Result<(), FlagError> {
        const NO_1_PREFIX: &str = "no_";
        const NO_2_PREFIX: &str = "no-";

        let (name, argument) = match option.find('=') {
            Some(equals_pos) => (&option[..equals_pos], &option[equals_pos + 1..]),
            None if option.len() > NO_1_PREFIX.len()
                && (option.starts_with(NO_1_PREFIX) || option.starts_with(NO_2_PREFIX)) =>
            {
                (&option[NO_1_PREFIX.len()..], "false")
            }
            None => (option, "true"),
        };

        Self::apply(&name.replace('-', "_"), argument)
    }

    fn process_command_line_flags(
        prefix: Option<&str>,
        flags: impl Iterator<Item = String>,
    ) -> Result<(), FlagError> {
        let mut flags_vec = flags.collect::<Vec<String>>();
        flags_vec.sort();

        let cli_prefix = prefix
            .map(|prefix| Cow::Owned(format!("--{}:", prefix)))
            .unwrap_or(Cow::Borrowed("--"));

        for flag in flags_vec.iter() {
            if is_valid_flag(flag, &cli_prefix) {
                Self::parse(&flag[cli_prefix.len()..])?;
            }
        }

        Self::with(true, |flags| flags.initialized = true);
        Ok(())
    }

    fn process_environmental_vars(
        prefix: Option<&str>,
        vars: impl Iterator<Item = (String, String)>,
    ) {
        let env_prefix = prefix
            .map(|prefix| format!("{}_", prefix.to_uppercase()))
            .unwrap_or_default();

        for (option, argument) in vars {
            let Some(name) = option.strip_prefix(env_prefix.as_str()) else {
                continue;
            };
            // Unrelated environment variables are expected here.
            let _ = Self::apply(&name.to_lowercase(), &argument);
        }
    }

    fn check_uninitialized() -> Result<(), FlagError> {
        match Self::with(false, |flags| flags.initialized) {
            None => Err(FlagError::NoFlags(std::any::type_name::<T>())),
            Some(true) => Err(FlagError::FlagsAlreadyInitialized(
                std::any::type_name::<T>(),
            )),
            Some(false) => Ok(()),
        }
    }
}

fn is_valid_flag(name: &str, prefix: &str) -> bool {
    name.len() > prefix.len() && name.starts_with(prefix)
}

/// Parse flags of group `T`. Environment variables are applied first so that
/// command-line flags take precedence.
pub fn parse<T: 'static>(
    args: impl Iterator<Item = String>,
    env: impl Iterator<Item = (String, String)>,
) -> Result<(), FlagError> {
    FlagsOf::<T>::check_uninitialized()?;
    FlagsOf::<T>::process_environmental_vars(None, env);
    FlagsOf::<T>::process_command_line_flags(None, args)
}

/// Same as [`parse`] but only considers `--prefix:name` arguments and `PREFIX_NAME` variables.
pub fn parse_with_prefix<T: 'static>(
    prefix: &str,
    args: impl Iterator<Item = String>,
    env: impl Iterator<Item = (String, String)>,
) -> Result<(), FlagError> {
    FlagsOf::<T>::check_uninitialized()?;
    FlagsOf::<T>::process_environmental_vars(Some(prefix), env);
    FlagsOf::<T>::process_command_line_flags(Some(prefix), args)
}

/// Registers a bool flag.
///
/// # Safety
///
/// `addr` must be valid for program lifetime.
#[doc(hidden)]
pub unsafe fn register_bool<T: 'static>(
    addr: *mut bool,
    name: &'static str,
    comment: &'static str,
) {
    FlagsOf::<T>::add_flag(Flag {
        comment,
        name,
        value: FlagValue::Bool(addr),
        is_set: false,
    });
}

/// Registers a usize flag.
///
/// # Safety
///
/// `addr` must be valid for program lifetime.
#[doc(hidden)]
pub unsafe fn register_usize<T: 'static>(
    addr: *mut usize,
    name: &'static str,
    comment: &'static str,
) {
    FlagsOf::<T>::add_flag(Flag {
        comment,
        name,
        value: FlagValue::Usize(addr),
        is_set: false,
    });
}

#[doc(hidden)]
pub use ctor::ctor;
#[doc(hidden)]
pub use paste;

/// Defines a flag in group `$of`.
///
/// Generates `<of>_<name>()`, `set_<of>_<name>()` and `is_<of>_<name>_set()`.
#[macro_export]
macro_rules! define_flag {
    ($of: ident => $typ: ident, $name: ident, $default_value: expr, $comment: literal) => {
        $crate::utils::flags::paste::paste! {
            static mut [<$of: upper _ FLAG_ $name:upper>]: $typ = $default_value;

            #[doc(hidden)]
            #[ctor::ctor]
            fn [<init_ $of:lower _ $name _flag>]() {
                unsafe {
                    $crate::utils::flags::[<register_ $typ:lower>]::<$of>(
                        std::ptr::addr_of_mut!([<$of: upper _ FLAG_ $name:upper>]),
                        stringify!($name),
                        $comment,
                    );
                }
            }

            #[doc = $comment]
            pub fn [<$of: lower _ $name>]() -> $typ {
                unsafe { std::ptr::addr_of!([<$of: upper _ FLAG_ $name:upper>]).read() }
            }

            pub fn [<set_ $of: lower _ $name>]($name: $typ) {
                unsafe {
                    std::ptr::addr_of_mut!([<$of: upper _ FLAG_ $name:upper>]).write($name);
                }
            }

            pub fn [<is_ $of: lower _ $name _set>]() -> bool {
                $crate::utils::flags::FlagsOf::<$of>::is_set(stringify!($name))
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestFlags;
    struct EnvFlags;
    struct EmptyFlags;

    define_flag!(TestFlags => bool, fast_path, true, "Enable the fast path");
    define_flag!(TestFlags => bool, tracing, false, "Trace every call");
    define_flag!(TestFlags => usize, interval, 16, "Reporting interval");

    define_flag!(EnvFlags => bool, checked, false, "Checked mode");
    define_flag!(EnvFlags => usize, depth, 1, "Depth");

    struct OtherFlags;
    define_flag!(OtherFlags => bool, known, false, "Known");

    struct MalformedFlags;
    define_flag!(MalformedFlags => usize, limit, 4, "Limit");
    define_flag!(MalformedFlags => bool, enabled, false, "Enabled");

    #[test]
    fn parses_command_line_flags() {
        assert!(testflags_fast_path());
        assert!(!is_testflags_fast_path_set());

        let args = [
            "program",
            "--no-fast-path",
            "--tracing",
            "--interval=0x20",
            "positional",
        ]
        .into_iter()
        .map(String::from);

        parse::<TestFlags>(args, std::iter::empty()).unwrap();

        assert!(!testflags_fast_path());
        assert!(testflags_tracing());
        assert_eq!(testflags_interval(), 0x20);
        assert!(is_testflags_interval_set());

        assert!(matches!(
            parse::<TestFlags>(std::iter::empty(), std::iter::empty()),
            Err(FlagError::FlagsAlreadyInitialized(_))
        ));

        let names = FlagsOf::<TestFlags>::describe()
            .into_iter()
            .map(|(name, _)| name)
            .collect::<Vec<_>>();
        assert!(names.contains(&"fast_path"));
        assert!(names.contains(&"interval"));
    }

    #[test]
    fn parses_prefixed_environment() {
        let env = [
            ("FASTLOCK_CHECKED", "true"),
            ("FASTLOCK_DEPTH", "not-a-number"),
            ("CHECKED", "false"),
            ("PATH", "/usr/bin"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()));

        parse_with_prefix::<EnvFlags>("fastlock", std::iter::empty(), env).unwrap();

        assert!(envflags_checked());
        assert_eq!(envflags_depth(), 1);
        assert!(!is_envflags_depth_set());
    }

    #[test]
    fn unknown_flag_is_reported() {
        let args = ["--unknown=1"].into_iter().map(String::from);
        assert!(matches!(
            parse::<OtherFlags>(args, std::iter::empty()),
            Err(FlagError::FlagNotFound(name)) if name == "unknown"
        ));
        assert!(matches!(
            parse::<EmptyFlags>(std::iter::empty(), std::iter::empty()),
            Err(FlagError::NoFlags(_))
        ));
    }

    #[test]
    fn malformed_values_are_ignored() {
        let args = [
            "--malformed:limit=xé",
            "--malformed:enabled=ja",
            "--malformed:limit=0xé",
        ]
        .into_iter()
        .map(String::from);
        let env = [("MALFORMED_LIMIT", "0x")]
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()));

        parse_with_prefix::<MalformedFlags>("malformed", args, env).unwrap();

        assert_eq!(malformedflags_limit(), 4);
        assert!(!is_malformedflags_limit_set());
        assert!(!malformedflags_enabled());
    }
}
