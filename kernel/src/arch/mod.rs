//! Architecture support. IA-32 is the only target; the module also
//! compiles on the host so its data layouts can be unit tested.

pub mod x86;
