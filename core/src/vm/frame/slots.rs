//! Checked register access and the out-argument stack.

use super::Activation;
use crate::error::{VmResult, ensure_fatal, fatal};
use crate::val::Val;
use crate::vm::numeric::NumericSlots;

/// Out-argument state captured at try entry and restored when a catch takes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OutSpMark {
    sp: u32,
    open_calls: usize,
}

impl Activation {
    #[inline]
    pub fn reg(&self, r: u32) -> VmResult<Val> {
        ensure_fatal!(
            r < self.body.local_count,
            "register r{r} out of range in '{}' ({} locals)",
            self.body.name,
            self.body.local_count
        );
        Ok(self.storage.slots()[r as usize].clone())
    }

    /// Store into a local register. Stack-resident closures must go through
    /// [`Activation::set_reg_allow_stack_var`].
    #[inline]
    pub fn set_reg(&mut self, r: u32, value: Val) -> VmResult<()> {
        if cfg!(debug_assertions) && value.is_stack_resident() {
            return Err(fatal(format!(
                "stack-resident closure stored into r{r} of '{}'",
                self.body.name
            )));
        }
        self.set_reg_allow_stack_var(r, value)
    }

    /// Store a value proven not to escape the current call.
    #[inline]
    pub fn set_reg_allow_stack_var(&mut self, r: u32, value: Val) -> VmResult<()> {
        let const_count = self.body.const_count();
        ensure_fatal!(
            r == 0 || r >= const_count,
            "write to constant slot r{r} in '{}'",
            self.body.name
        );
        ensure_fatal!(
            r < self.body.local_count,
            "register r{r} out of range in '{}' ({} locals)",
            self.body.name,
            self.body.local_count
        );
        self.storage.slots_mut()[r as usize] = value;
        Ok(())
    }

    #[inline]
    pub fn out_sp(&self) -> u32 {
        self.out_sp
    }

    /// Reserve `argc` out-argument slots for the next call.
    pub fn start_call(&mut self, argc: u32) -> VmResult<()> {
        let limit = self.body.local_count + self.body.max_out_param_depth;
        ensure_fatal!(
            self.out_sp + argc <= limit,
            "out-argument overflow in '{}': sp {} + {argc} > {limit}",
            self.body.name,
            self.out_sp
        );
        self.out_marks.push((self.out_sp, argc));
        self.out_sp += argc;
        Ok(())
    }

    /// Stage argument `index` of the innermost open call.
    pub fn set_out(&mut self, index: u32, value: Val) -> VmResult<()> {
        let &(base, argc) = self
            .out_marks
            .last()
            .ok_or_else(|| fatal(format!("ArgOut without StartCall in '{}'", self.body.name)))?;
        ensure_fatal!(
            index < argc,
            "out-argument {index} outside reservation of {argc} in '{}'",
            self.body.name
        );
        self.storage.slots_mut()[(base + index) as usize] = value;
        Ok(())
    }

    /// Staged arguments of the innermost open call, which must reserve exactly `argc`.
    pub fn out_args(&self, argc: u32) -> VmResult<&[Val]> {
        let &(base, reserved) = self
            .out_marks
            .last()
            .ok_or_else(|| fatal(format!("call without StartCall in '{}'", self.body.name)))?;
        ensure_fatal!(
            reserved == argc,
            "call argc {argc} does not match StartCall {reserved} in '{}'",
            self.body.name
        );
        Ok(&self.storage.slots()[base as usize..(base + argc) as usize])
    }

    /// Release the innermost reservation.
    pub fn pop_out(&mut self, argc: u32) -> VmResult<()> {
        let (base, reserved) = self
            .out_marks
            .pop()
            .ok_or_else(|| fatal(format!("out-argument underflow in '{}'", self.body.name)))?;
        ensure_fatal!(
            reserved == argc,
            "pop of {argc} out-arguments does not match reservation of {reserved} in '{}'",
            self.body.name
        );
        for slot in &mut self.storage.slots_mut()[base as usize..(base + argc) as usize] {
            *slot = Val::Undefined;
        }
        self.out_sp = base;
        Ok(())
    }

    pub(crate) fn cache_sp(&self) -> OutSpMark {
        OutSpMark {
            sp: self.out_sp,
            open_calls: self.out_marks.len(),
        }
    }

    /// Abandon every reservation opened after `mark`, clearing the staged values.
    pub(crate) fn restore_sp(&mut self, mark: OutSpMark) {
        self.out_marks.truncate(mark.open_calls);
        if self.out_sp > mark.sp {
            let (from, to) = (mark.sp as usize, self.out_sp as usize);
            for slot in &mut self.storage.slots_mut()[from..to] {
                *slot = Val::Undefined;
            }
        }
        self.out_sp = mark.sp;
    }

    /// Back to the function-entry state: no open calls.
    pub fn reset_out(&mut self) {
        self.out_marks.clear();
        self.out_sp = self.body.local_count;
    }

    pub fn numeric(&self) -> VmResult<&NumericSlots> {
        self.numeric
            .as_ref()
            .ok_or_else(|| fatal(format!("'{}' has no numeric slots", self.body.name)))
    }

    pub fn numeric_mut(&mut self) -> VmResult<&mut NumericSlots> {
        let name = &self.body.name;
        self.numeric
            .as_mut()
            .ok_or_else(|| fatal(format!("'{name}' has no numeric slots")))
    }

    /// Raw views of the boxed registers and the typed slots for native loop bodies.
    pub(crate) fn native_view(&mut self) -> (&mut [Val], Option<&mut NumericSlots>) {
        let locals = self.body.local_count as usize;
        (&mut self.storage.slots_mut()[..locals], self.numeric.as_mut())
    }
}
