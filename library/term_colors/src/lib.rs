//! Colouring for the names that log lines are about: pods, users and apps are cyan, fatal
//! errors are red.

use ansi_term::{ANSIGenericString, Color};
use std::borrow::Cow;

pub fn cyan<'a, I, S: 'a + ToOwned + ?Sized>(input: I) -> ANSIGenericString<'a, S>
where
    I: Into<Cow<'a, S>>,
    <S as ToOwned>::Owned: std::fmt::Debug,
{
    Color::Cyan.paint(input)
}

pub fn red<'a, I, S: 'a + ToOwned + ?Sized>(input: I) -> ANSIGenericString<'a, S>
where
    I: Into<Cow<'a, S>>,
    <S as ToOwned>::Owned: std::fmt::Debug,
{
    Color::Red.paint(input)
}
