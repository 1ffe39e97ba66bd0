use std::any::Any;
use std::net::IpAddr;

use regex::Regex;

use crate::types::Cidr;

use super::runner::{RunError, RunResult, Runner};

/// Argument window handed to a native callback. Arguments are 1-based;
/// register 0 of the window receives the result.
pub struct Params<'r, 'p> {
    runner: &'r mut Runner<'p>,
    base: usize,
    argc: usize,
}

impl<'r, 'p> Params<'r, 'p> {
    pub(crate) fn new(runner: &'r mut Runner<'p>, base: usize, argc: usize) -> Self {
        Params { runner, base, argc }
    }

    pub fn argc(&self) -> usize {
        self.argc
    }

    fn raw(&self, index: usize) -> RunResult<u64> {
        if index == 0 || index > self.argc {
            return Err(RunError::Native(format!("argument {index} out of range (argc {})", self.argc)));
        }
        self.runner.register(self.base + index)
    }

    pub fn get_bool(&self, index: usize) -> RunResult<bool> {
        Ok(self.raw(index)? != 0)
    }

    pub fn get_int(&self, index: usize) -> RunResult<i64> {
        Ok(self.raw(index)? as i64)
    }

    pub fn get_string(&self, index: usize) -> RunResult<&str> {
        self.runner.string(self.raw(index)?)
    }

    pub fn get_ipaddr(&self, index: usize) -> RunResult<IpAddr> {
        self.runner.ipaddr(self.raw(index)?)
    }

    pub fn get_cidr(&self, index: usize) -> RunResult<Cidr> {
        self.runner.cidr(self.raw(index)?)
    }

    pub fn get_regex(&self, index: usize) -> RunResult<&'p Regex> {
        self.runner.regex(self.raw(index)?)
    }

    /// Handler reference argument, as a handler index into the program.
    pub fn get_handler(&self, index: usize) -> RunResult<usize> {
        Ok(self.raw(index)? as usize)
    }

    pub fn get_int_array(&self, index: usize) -> RunResult<&'p [i64]> {
        self.runner.int_array(self.raw(index)?)
    }

    pub fn get_string_array(&self, index: usize) -> RunResult<&'p [String]> {
        self.runner.string_array(self.raw(index)?)
    }

    pub fn get_ipaddr_array(&self, index: usize) -> RunResult<&'p [IpAddr]> {
        self.runner.ipaddr_array(self.raw(index)?)
    }

    pub fn get_cidr_array(&self, index: usize) -> RunResult<&'p [Cidr]> {
        self.runner.cidr_array(self.raw(index)?)
    }

    /// Stores the call result. For native handlers `true` means handled.
    pub fn set_result(&mut self, value: impl IntoRegister) -> RunResult<()> {
        let raw = value.into_register(self.runner);
        self.runner.set_register(self.base, raw)
    }

    pub fn runner(&mut self) -> &mut Runner<'p> {
        self.runner
    }

    /// Host data attached with `Runner::with_userdata`, if it has type `T`.
    pub fn userdata<T: Any>(&mut self) -> Option<&mut T> {
        self.runner.userdata_mut().and_then(|d| d.downcast_mut::<T>())
    }
}

/// Conversion of a host value into a register word, allocating on the
/// runner heap where needed.
pub trait IntoRegister {
    fn into_register(self, runner: &mut Runner<'_>) -> u64;
}

impl IntoRegister for bool {
    fn into_register(self, _: &mut Runner<'_>) -> u64 {
        self as u64
    }
}

impl IntoRegister for i64 {
    fn into_register(self, _: &mut Runner<'_>) -> u64 {
        self as u64
    }
}

impl IntoRegister for String {
    fn into_register(self, runner: &mut Runner<'_>) -> u64 {
        runner.create_string(self)
    }
}

impl IntoRegister for &str {
    fn into_register(self, runner: &mut Runner<'_>) -> u64 {
        runner.create_string(self)
    }
}

impl IntoRegister for IpAddr {
    fn into_register(self, runner: &mut Runner<'_>) -> u64 {
        runner.create_ipaddr(self)
    }
}

impl IntoRegister for Cidr {
    fn into_register(self, runner: &mut Runner<'_>) -> u64 {
        runner.create_cidr(self)
    }
}
