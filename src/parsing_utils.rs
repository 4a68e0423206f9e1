use nom::bytes::complete::take_till;
use nom::character::complete::{multispace0, none_of};
use nom::combinator::map_res;
use nom::multi::many1;
use nom::IResult;

pub(crate) fn consume_string(l: &str) -> IResult<&str, String> {
    let (rest, _) = multispace0(l)?;
    let (rest, token) = many1(none_of(" \t\r\n"))(rest)?;
    Ok((rest, token.into_iter().collect()))
}

pub(crate) fn consume_digit(l: &str) -> IResult<&str, u64> {
    let (rest, _) = multispace0(l)?;
    map_res(take_till(|c: char| !c.is_ascii_digit()), |s: &str| {
        s.parse::<u64>()
    })(rest)
}
